//! Synchronous request driver: pumps a gateway from a blocking call until
//! an in-flight request completes or a deadline passes (§4.10), grounded
//! on the "ExecuteSynchronousMessaging" helper shape this core specifies.

use crate::gateway::{IoGateway, MessageReceiver};
use crate::mux::SocketMultiplexer;
use crate::status::{ErrorKind, Status, StatusResult};
use std::time::{Duration, Instant};

/// Repeatedly multiplexes and pumps `gateway` until `still_awaiting_reply`
/// returns false or `deadline` passes (§4.10).
pub fn execute_synchronous_messaging(
    gateway: &mut IoGateway,
    receiver: &mut dyn MessageReceiver,
    deadline: Instant,
    mut still_awaiting_reply: impl FnMut() -> bool,
) -> StatusResult<()> {
    let mut mux = SocketMultiplexer::with_most_capable_backend()?;

    while still_awaiting_reply() {
        let now = Instant::now();
        if now >= deadline {
            return Err(Status::new(ErrorKind::TimedOut));
        }

        let read_fd = gateway.data_io().read_select_fd();
        let write_fd = gateway.data_io().write_select_fd();
        if gateway.has_bytes_to_output() {
            if let Some(fd) = write_fd {
                mux.register_for_write(fd);
            }
        }
        if let Some(fd) = read_fd {
            mux.register_for_read(fd);
        }

        mux.wait_for_events(Some(deadline))?;

        if gateway.has_bytes_to_output() {
            if let Some(fd) = write_fd {
                if mux.is_ready_for_write(fd) {
                    let result = gateway.do_output(usize::MAX);
                    if result.is_error() {
                        return Err(result.status());
                    }
                }
            }
        }
        if let Some(fd) = read_fd {
            if mux.is_ready_for_read(fd) {
                let result = gateway.do_input(receiver, usize::MAX);
                if result.is_error() {
                    return Err(result.status());
                }
            }
        }
    }
    Ok(())
}

/// Convenience wrapper mirroring §4.10's "given a timeout duration"
/// framing rather than an absolute deadline.
pub fn execute_synchronous_messaging_with_timeout(
    gateway: &mut IoGateway,
    receiver: &mut dyn MessageReceiver,
    timeout: Duration,
    still_awaiting_reply: impl FnMut() -> bool,
) -> StatusResult<()> {
    execute_synchronous_messaging(gateway, receiver, Instant::now() + timeout, still_awaiting_reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataio::UnixDataIo;
    use crate::message::Message;
    use std::os::unix::net::UnixStream;

    struct Collector(Vec<Message>);
    impl MessageReceiver for Collector {
        fn message_received(&mut self, msg: Message) {
            self.0.push(msg);
        }
    }

    #[test]
    fn returns_once_the_reply_arrives() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut requester = IoGateway::new(Box::new(UnixDataIo::new(a).unwrap()));
        let mut responder = IoGateway::new(Box::new(UnixDataIo::new(b).unwrap()));

        let mut request = Message::new(1);
        request.add_string("q", "ping").unwrap();
        requester.add_outgoing_message(request);

        let mut reply = Message::new(2);
        reply.add_string("a", "pong").unwrap();
        responder.add_outgoing_message(reply.clone());
        responder.do_output(4096);

        let mut collector = Collector(Vec::new());
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut got_reply = false;
        execute_synchronous_messaging(&mut requester, &mut collector, deadline, || {
            if !got_reply && !collector.0.is_empty() {
                got_reply = true;
            }
            !got_reply
        })
        .unwrap();

        assert_eq!(collector.0.len(), 1);
        assert_eq!(collector.0[0], reply);
        let _ = responder.do_input(&mut Collector(Vec::new()), 1024);
    }

    #[test]
    fn times_out_when_no_reply_arrives() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut requester = IoGateway::new(Box::new(UnixDataIo::new(a).unwrap()));
        let mut collector = Collector(Vec::new());
        let deadline = Instant::now() + Duration::from_millis(80);
        let result =
            execute_synchronous_messaging(&mut requester, &mut collector, deadline, || true);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::TimedOut);
    }
}
