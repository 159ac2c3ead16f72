//! Requesting side of the protocol.

use crate::protocol;
use bytes::{Bytes, BytesMut};
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

/// Largest reply read by [`request_sys_info`].
pub const BUFFER_SIZE: usize = 1024;

/// Send `GET_SYS_INFO` and return whatever a single read yields.
///
/// An empty reply means the server closed without answering.
pub fn request_sys_info<A: ToSocketAddrs>(addr: A) -> io::Result<Bytes> {
    let mut stream = TcpStream::connect(addr)?;
    if let Ok(peer) = stream.peer_addr() {
        debug!(peer = %peer, "Connected to server");
    }

    stream.write_all(protocol::GET_SYS_INFO)?;
    info!("GET_SYS_INFO message sent");

    let mut buf = BytesMut::zeroed(BUFFER_SIZE);
    let n = stream.read(&mut buf)?;
    buf.truncate(n);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_request_reads_single_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 64];
            let n = stream.read(&mut request).unwrap();
            stream.write_all(b" 10:00:00 up 1 day\n").unwrap();
            request[..n].to_vec()
        });

        let reply = request_sys_info(addr).unwrap();
        assert_eq!(&reply[..], b" 10:00:00 up 1 day\n");
        assert_eq!(server.join().unwrap(), b"GET_SYS_INFO\n");
    }

    #[test]
    fn test_closed_without_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = [0u8; 64];
            let _ = stream.read(&mut request);
        });

        let reply = request_sys_info(addr).unwrap();
        assert!(reply.is_empty());
        server.join().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(request_sys_info(("127.0.0.1", port)).is_err());
    }
}
