// Exercises the full stack — EventLoop, CommandParser, LRUStore — the way
// a client actually sees it: over a real TCP socket, not through internal
// APIs.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use boundedkv_core::{EventLoop, LRUStore};

fn start_server() -> (SocketAddr, boundedkv_core::ShutdownHandle, std::thread::JoinHandle<()>) {
    let store = Arc::new(Mutex::new(LRUStore::new(256)));
    let (mut event_loop, handle) =
        EventLoop::bind("127.0.0.1:0".parse().unwrap(), store).expect("bind");
    let addr = event_loop.listener_addr();
    let join = std::thread::spawn(move || {
        event_loop.run().expect("event loop run");
    });
    (addr, handle, join)
}

fn read_line(reader: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read line");
    line
}

#[test]
fn put_get_delete_round_trip_over_tcp() {
    let (addr, handle, join) = start_server();
    let mut client = TcpStream::connect(addr).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut reader = BufReader::new(client.try_clone().unwrap());

    client.write_all(b"PUT k 3\r\nval\r\n").unwrap();
    // "val" is 3 bytes but declared length is also 3 — body is "val".
    assert_eq!(read_line(&mut reader), "STORED\r\n");

    client.write_all(b"GET k\r\n").unwrap();
    assert_eq!(read_line(&mut reader), "VALUE 3\r\n");
    assert_eq!(read_line(&mut reader), "val\r\n");
    assert_eq!(read_line(&mut reader), "END\r\n");

    client.write_all(b"DELETE k\r\n").unwrap();
    assert_eq!(read_line(&mut reader), "DELETED\r\n");

    client.write_all(b"GET k\r\n").unwrap();
    assert_eq!(read_line(&mut reader), "NOT_FOUND\r\n");

    drop(client);
    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn oversized_value_is_rejected_without_corrupting_the_store() {
    let (addr, handle, join) = start_server();
    let mut client = TcpStream::connect(addr).expect("connect");
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut reader = BufReader::new(client.try_clone().unwrap());

    let big = vec![b'x'; 1024];
    client.write_all(b"PUT big ").unwrap();
    client
        .write_all(format!("{}\r\n", big.len()).as_bytes())
        .unwrap();
    client.write_all(&big).unwrap();
    client.write_all(b"\r\n").unwrap();
    assert_eq!(read_line(&mut reader), "TOO_LARGE\r\n");

    client.write_all(b"GET big\r\n").unwrap();
    assert_eq!(read_line(&mut reader), "NOT_FOUND\r\n");

    drop(client);
    handle.shutdown();
    join.join().unwrap();
}

#[test]
fn two_concurrent_clients_share_the_same_store() {
    let (addr, handle, join) = start_server();

    let mut writer = TcpStream::connect(addr).expect("connect");
    writer
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut writer_reader = BufReader::new(writer.try_clone().unwrap());
    writer.write_all(b"PUT shared 2\r\nhi\r\n").unwrap();
    assert_eq!(read_line(&mut writer_reader), "STORED\r\n");

    let mut reader_client = TcpStream::connect(addr).expect("connect");
    reader_client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut reader_reader = BufReader::new(reader_client.try_clone().unwrap());
    reader_client.write_all(b"GET shared\r\n").unwrap();
    assert_eq!(read_line(&mut reader_reader), "VALUE 2\r\n");
    assert_eq!(read_line(&mut reader_reader), "hi\r\n");
    assert_eq!(read_line(&mut reader_reader), "END\r\n");

    drop(writer);
    drop(reader_client);
    handle.shutdown();
    join.join().unwrap();
}
