// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Event-loop collaborator round trips over real sockets.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use skein_rt::{EventLoop, IoMsg, IoTag, Kernel, Port, IO_UNIT};

#[test]
fn tcp_connect_write_read() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        stream.write_all(b"world").unwrap();
    });

    let kernel = Kernel::new();
    let evloop = Arc::new(EventLoop::new(kernel.clone()).unwrap());
    let el = evloop.clone();

    let status = kernel
        .run_main(1, move || {
            let port = Port::new(IO_UNIT);
            let chan = port.chan();
            let mut buf = [0u8; IO_UNIT];

            el.connect(1, addr, chan);
            port.recv(&mut buf);
            assert_eq!(IoMsg::from_bytes(&buf).tag, IoTag::Connected);

            el.write(1, b"hello".to_vec(), chan);
            port.recv(&mut buf);
            let wrote = IoMsg::from_bytes(&buf);
            assert_eq!(wrote.tag, IoTag::Wrote);
            assert_eq!(wrote.len, 5);

            el.read_start(1, chan);
            let mut got = Vec::new();
            loop {
                port.recv(&mut buf);
                let msg = IoMsg::from_bytes(&buf);
                assert_eq!(msg.tag, IoTag::Read);
                if let Some(data) = el.take_read(1) {
                    got.extend(data);
                }
                if got.len() >= 5 || msg.len == 0 {
                    break;
                }
            }
            assert_eq!(&got, b"world");
            el.close_connection(1);
        })
        .unwrap();

    assert_eq!(status, 0);
    evloop.stop(None);
    server.join().unwrap();
}

#[test]
fn timer_wakes_a_selecting_task() {
    let kernel = Kernel::new();
    let evloop = Arc::new(EventLoop::new(kernel.clone()).unwrap());
    let el = evloop.clone();

    let status = kernel
        .run_main(1, move || {
            let fast = Port::new(IO_UNIT);
            let slow = Port::new(IO_UNIT);
            el.timer(1, Duration::from_millis(200), slow.chan());
            el.timer(2, Duration::from_millis(10), fast.chan());

            let idx = skein_rt::select(&[&slow, &fast]);
            assert_eq!(idx, 1, "the short timer should win the select");
            let mut buf = [0u8; IO_UNIT];
            assert!(fast.try_recv(&mut buf));
            assert_eq!(IoMsg::from_bytes(&buf).req_id, 2);
        })
        .unwrap();

    assert_eq!(status, 0);
    evloop.stop(None);
}
