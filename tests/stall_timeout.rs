//! End-to-end scenario 4 (§8): a session whose peer stops reading stops
//! draining its outgoing queue; once that keeps failing to progress
//! past the configured stall limit, the reactor evicts it rather than
//! letting it wedge the process.

use anyhow::Result;
use muscle_reactor::config::ReactorConfig;
use muscle_reactor::factory::SessionFactory;
use muscle_reactor::reactor::ReflectServer;
use muscle_reactor::session::SessionCallbacks;
use muscle_reactor::Message;
use std::net::TcpStream;
use std::time::Duration;

struct SilentCallbacks;
impl SessionCallbacks for SilentCallbacks {
    fn message_received(
        &mut self,
        _msg: Message,
        _outgoing: &mut muscle_reactor::session::OutgoingMessages,
    ) {
    }
}

#[test]
fn a_peer_that_never_drains_gets_evicted_after_the_stall_limit() -> Result<()> {
    let mut server = ReflectServer::new(ReactorConfig::default())?;

    let (factory, port) = SessionFactory::bind(
        "127.0.0.1:0".parse()?,
        Box::new(|_peer| Box::new(SilentCallbacks) as Box<dyn SessionCallbacks>),
    )?;
    let addr = factory.local_addr()?;
    server.add_factory(addr, factory);

    // Connect but never read: the kernel send buffer on the server side
    // will fill once we push enough outgoing bytes.
    let _client = TcpStream::connect(("127.0.0.1", port))?;

    let mut id = None;
    for _ in 0..100 {
        server.run_one_iteration()?;
        if let Some(existing) = server.session_ids().into_iter().next() {
            id = Some(existing);
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    let id = id.expect("server never accepted the connection");

    {
        let session = server.session_mut(id).unwrap();
        session.set_stall_limit(Some(Duration::from_millis(100)));
        let gw = session.gateway_mut().unwrap();
        let mut big = Message::new(1);
        big.add_string("payload", "x".repeat(64 * 1024)).unwrap();
        for _ in 0..64 {
            gw.add_outgoing_message(big.clone());
        }
    }

    let mut evicted = false;
    for _ in 0..400 {
        server.run_one_iteration()?;
        if server.session(id).is_none() {
            evicted = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(evicted, "stalled session was never evicted");
    Ok(())
}
