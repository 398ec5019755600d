//! Channel abstraction
//!
//! The protocol core is socket-agnostic: it talks to a [`Channel`], which
//! moves framed messages (see [`crate::messages`]) and counts bytes. The
//! stock implementation, [`StreamChannel`], works over any `Read`/`Write`
//! pair — a TCP stream, a Unix socket, or an in-memory pipe in tests — and
//! blocks on receive. Delivery is assumed at-most-once per message; the only
//! ordering the core relies on is that a `QueryResponse` precedes its result
//! parts.

use std::io::{Read, Write};

use crate::messages::{
    read_request, read_response, read_result_part, write_request, write_response,
    write_result_part, Request, Response, ResultPart,
};
use crate::Result;

/// Transport used by both parties. Implementations may block on receive.
pub trait Channel {
    /// Send a request (receiver → sender).
    fn send_request(&mut self, request: &Request) -> Result<()>;
    /// Receive a request, blocking until one arrives.
    fn receive_request(&mut self) -> Result<Request>;
    /// Send a response (sender → receiver).
    fn send_response(&mut self, response: &Response) -> Result<()>;
    /// Receive a response, blocking until one arrives.
    fn receive_response(&mut self) -> Result<Response>;
    /// Send one streamed result part.
    fn send_result_part(&mut self, part: &ResultPart) -> Result<()>;
    /// Receive one streamed result part.
    fn receive_result_part(&mut self) -> Result<ResultPart>;
    /// Total bytes put on the wire by this end.
    fn bytes_sent(&self) -> u64;
    /// Total bytes taken off the wire by this end.
    fn bytes_received(&self) -> u64;
}

/// Blocking channel over a `Read`/`Write` pair.
pub struct StreamChannel<R: Read, W: Write> {
    reader: R,
    writer: W,
    bytes_sent: u64,
    bytes_received: u64,
}

impl<R: Read, W: Write> StreamChannel<R, W> {
    /// Wrap a reader/writer pair.
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer, bytes_sent: 0, bytes_received: 0 }
    }
}

impl<R: Read, W: Write> Channel for StreamChannel<R, W> {
    fn send_request(&mut self, request: &Request) -> Result<()> {
        self.bytes_sent += write_request(&mut self.writer, request)?;
        Ok(())
    }

    fn receive_request(&mut self) -> Result<Request> {
        let (request, size) = read_request(&mut self.reader)?;
        self.bytes_received += size;
        Ok(request)
    }

    fn send_response(&mut self, response: &Response) -> Result<()> {
        self.bytes_sent += write_response(&mut self.writer, response)?;
        Ok(())
    }

    fn receive_response(&mut self) -> Result<Response> {
        let (response, size) = read_response(&mut self.reader)?;
        self.bytes_received += size;
        Ok(response)
    }

    fn send_result_part(&mut self, part: &ResultPart) -> Result<()> {
        self.bytes_sent += write_result_part(&mut self.writer, part)?;
        Ok(())
    }

    fn receive_result_part(&mut self) -> Result<ResultPart> {
        let (part, size) = read_result_part(&mut self.reader)?;
        self.bytes_received += size;
        Ok(part)
    }

    fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{OprfRequest, QueryResponse};
    use std::io::{BufReader, BufWriter};
    use std::os::unix::net::UnixStream;

    #[test]
    fn stream_channel_moves_messages_and_counts_bytes() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut left = StreamChannel::new(
            BufReader::new(a.try_clone().unwrap()),
            BufWriter::new(a),
        );
        let mut right = StreamChannel::new(
            BufReader::new(b.try_clone().unwrap()),
            BufWriter::new(b),
        );

        left.send_request(&Request::Oprf(OprfRequest { data: vec![5; 64] })).unwrap();
        let got = right.receive_request().unwrap();
        assert_eq!(got, Request::Oprf(OprfRequest { data: vec![5; 64] }));
        assert_eq!(left.bytes_sent(), right.bytes_received());
        assert_eq!(left.bytes_received(), 0);

        right
            .send_response(&Response::Query(QueryResponse { package_count: 1 }))
            .unwrap();
        let got = left.receive_response().unwrap();
        assert_eq!(got, Response::Query(QueryResponse { package_count: 1 }));
        assert_eq!(right.bytes_sent(), left.bytes_received());
    }
}
