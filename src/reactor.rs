//! The reactor (`ReflectServer`): owns the sockets-to-factories map, the
//! sessions map, the lame-duck lists, and the single-threaded cooperative
//! event loop described step-by-step in §4.8.

use crate::config::ReactorConfig;
use crate::dataio::TcpDataIo;
use crate::factory::SessionFactory;
use crate::gateway::IoGateway;
use crate::mux::SocketMultiplexer;
use crate::policy::IoPolicy;
use crate::session::{Session, SessionId, SessionState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Identifies one policy instance regardless of how many sessions share
/// it, so the reactor calls `begin_io`/`end_io` exactly once per cycle
/// per distinct policy (§4.8 steps 4 and 9).
type PolicyKey = usize;

fn policy_key(policy: &Arc<Mutex<dyn IoPolicy>>) -> PolicyKey {
    Arc::as_ptr(policy) as *const () as usize
}

/// The single-threaded cooperative event loop and its owned state
/// (§2 component 8, §4.8, §5).
pub struct ReflectServer {
    config: ReactorConfig,
    mux: SocketMultiplexer,
    sessions: HashMap<SessionId, Session>,
    factories: HashMap<SocketAddr, SessionFactory>,
    lame_duck_sessions: Vec<SessionId>,
    lame_duck_factories: Vec<SocketAddr>,
    shutdown_requested: bool,
    last_pulse_times: HashMap<SessionId, Instant>,
    oom_hook: Option<Box<dyn FnMut() -> bool + Send>>,
}

impl ReflectServer {
    pub fn new(config: ReactorConfig) -> crate::status::StatusResult<Self> {
        Ok(ReflectServer {
            config,
            mux: SocketMultiplexer::with_most_capable_backend()?,
            sessions: HashMap::new(),
            factories: HashMap::new(),
            lame_duck_sessions: Vec::new(),
            lame_duck_factories: Vec::new(),
            shutdown_requested: false,
            last_pulse_times: HashMap::new(),
            oom_hook: None,
        })
    }

    pub fn set_oom_hook(&mut self, hook: Box<dyn FnMut() -> bool + Send>) {
        self.oom_hook = Some(hook);
    }

    pub fn add_factory(&mut self, addr: SocketAddr, mut factory: SessionFactory) {
        factory.mark_attached();
        self.factories.insert(addr, factory);
    }

    /// All currently live session ids, in arbitrary order.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    /// Removes a factory by deferring its destruction to the next cycle's
    /// lame-duck drain, so a factory may safely remove itself from
    /// inside its own callback (§4.7).
    pub fn remove_factory(&mut self, addr: SocketAddr) {
        self.lame_duck_factories.push(addr);
    }

    pub fn add_session(&mut self, session: Session) -> SessionId {
        let id = session.id();
        self.sessions.insert(id, session);
        id
    }

    pub fn remove_session(&mut self, id: SessionId) {
        self.lame_duck_sessions.push(id);
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn request_shutdown(&mut self) {
        self.shutdown_requested = true;
    }

    fn read_fd_of(session: &Session) -> Option<RawFd> {
        session.gateway().and_then(|g| g.data_io().read_select_fd())
    }

    fn write_fd_of(session: &Session) -> Option<RawFd> {
        session.gateway().and_then(|g| g.data_io().write_select_fd())
    }

    /// Step 1: destroy everything scheduled for removal last cycle.
    ///
    /// Forgets each removed session's fd(s) with the multiplexer before
    /// dropping it: for epoll/kqueue backends, closing the fd doesn't by
    /// itself clear the backend's userland interest bookkeeping, and a
    /// later `accept()` reusing that same fd number would otherwise be
    /// mistaken for an already-registered descriptor and silently never
    /// get its events armed.
    fn drain_lame_duck_lists(&mut self) {
        for id in self.lame_duck_sessions.drain(..) {
            if let Some(session) = self.sessions.remove(&id) {
                if let Some(fd) = Self::read_fd_of(&session) {
                    self.mux.forget_socket(fd);
                }
                if let Some(fd) = Self::write_fd_of(&session) {
                    self.mux.forget_socket(fd);
                }
                debug!(session_id = id.as_u64(), "session destroyed");
            }
            self.last_pulse_times.remove(&id);
        }
        for addr in self.lame_duck_factories.drain(..) {
            if let Some(factory) = self.factories.remove(&addr) {
                self.mux.forget_socket(factory.listen_fd());
                debug!(%addr, "factory destroyed");
            }
        }
    }

    /// Step 2: earliest of every pulsable object's next deadline.
    fn compute_next_wakeup(&self, now: Instant) -> Instant {
        let mut earliest = now + self.config.pulse_granularity;

        for session in self.sessions.values() {
            if let Some(deadline) = session.async_connect_deadline() {
                earliest = earliest.min(deadline);
            }
            if let Some(limit) = session.stall_limit() {
                earliest = earliest.min(now + limit);
            }
        }

        let mut seen_policies = std::collections::HashSet::new();
        for session in self.sessions.values() {
            for policy in [session.input_policy(), session.output_policy()]
                .into_iter()
                .flatten()
            {
                let key = policy_key(&policy.0);
                if seen_policies.insert(key) {
                    if let Ok(guard) = policy.0.lock() {
                        if let Some(t) = guard.get_pulse_time(Some(now)) {
                            earliest = earliest.min(t);
                        }
                    }
                }
            }
        }
        earliest
    }

    /// Step 3: registration pass.
    fn register_interest(&mut self) {
        for factory in self.factories.values() {
            if factory.is_attached() {
                self.mux.register_for_read(factory.listen_fd());
            }
        }

        for session in self.sessions.values_mut() {
            if session.state() == SessionState::Connecting {
                if let Some(fd) = Self::write_fd_of(session) {
                    self.mux.register_for_write(fd);
                    #[cfg(target_os = "windows")]
                    self.mux.register_for_exception(fd);
                }
                continue;
            }
            if session.state() != SessionState::Connected {
                continue;
            }

            let input_cap = match session.input_policy() {
                Some((policy, holder)) => policy
                    .lock()
                    .map(|mut p| {
                        let now = Instant::now();
                        if p.okay_to_transfer(*holder, now) {
                            p.get_max_transfer_chunk_size(*holder)
                        } else {
                            0
                        }
                    })
                    .unwrap_or(0),
                None => usize::MAX,
            };

            let wants_input = input_cap > 0
                && session
                    .gateway()
                    .map(|g| g.is_ready_for_input())
                    .unwrap_or(false);
            if wants_input {
                if let Some(fd) = Self::read_fd_of(session) {
                    self.mux.register_for_read(fd);
                }
            }

            let wants_output = session
                .gateway()
                .map(|g| g.has_bytes_to_output())
                .unwrap_or(false);
            if wants_output {
                session.note_output_pending_if_new(Instant::now());
                if let Some(fd) = Self::write_fd_of(session) {
                    self.mux.register_for_write(fd);
                }
            } else {
                session.clear_output_pending();
            }
        }
    }

    /// Step 4 / step 9: distinct-policy begin/end pass.
    fn for_each_distinct_policy(&self, mut f: impl FnMut(&Arc<Mutex<dyn IoPolicy>>)) {
        let mut seen = std::collections::HashSet::new();
        for session in self.sessions.values() {
            for policy in [session.input_policy(), session.output_policy()]
                .into_iter()
                .flatten()
            {
                if seen.insert(policy_key(&policy.0)) {
                    f(&policy.0);
                }
            }
        }
    }

    /// Step 6: check whether any tracked pool reported a failed
    /// allocation since the last check, and if so drop one expendable
    /// session to reclaim memory (§4.8 step 6, §7).
    ///
    /// Simplification: this core's pool hook is process-wide rather than
    /// per-allocation-site attributable, so on OOM it evicts the first
    /// expendable session found rather than the precise offending one.
    fn check_oom(&mut self) {
        let oom_detected = match &mut self.oom_hook {
            Some(hook) => hook(),
            None => false,
        };
        if !oom_detected {
            return;
        }
        warn!("allocator reported a failed allocation; evicting an expendable session");
        if let Some((&id, _)) = self.sessions.iter().find(|(_, s)| s.is_expendable()) {
            self.lame_duck_sessions.push(id);
        }
        let threshold = self.config.oom_queue_size_threshold;
        for (&id, session) in self.sessions.iter() {
            if let Some(gw) = session.gateway() {
                if gw.outgoing_queue_len() * 64 > threshold {
                    self.lame_duck_sessions.push(id);
                }
            }
        }
    }

    /// Step 7 + step 8: per-session I/O and stall detection.
    fn pump_session_io(&mut self, deadline: Instant) {
        let now = Instant::now();
        let session_ids: Vec<SessionId> = self.sessions.keys().copied().collect();

        for id in session_ids {
            let (read_fd, write_fd, state) = {
                let session = match self.sessions.get(&id) {
                    Some(s) => s,
                    None => continue,
                };
                (
                    Self::read_fd_of(session),
                    Self::write_fd_of(session),
                    session.state(),
                )
            };

            if state == SessionState::Connecting {
                if write_fd.map(|fd| self.mux.is_ready_for_write(fd)).unwrap_or(false) {
                    if let Some(session) = self.sessions.get_mut(&id) {
                        info!(session_id = id.as_u64(), "async connect completed");
                        session.callbacks_mut().async_connect_completed();
                    }
                }
                continue;
            }
            if state != SessionState::Connected {
                continue;
            }

            if read_fd.map(|fd| self.mux.is_ready_for_read(fd)).unwrap_or(false) {
                self.do_session_input(id);
            }
            if write_fd.map(|fd| self.mux.is_ready_for_write(fd)).unwrap_or(false) {
                self.do_session_output(id, now);
            }

            if let Some(session) = self.sessions.get(&id) {
                if session.is_stalled(now) {
                    warn!(session_id = id.as_u64(), "session stalled: output not draining");
                    self.lame_duck_sessions.push(id);
                }
            }
        }
        let _ = deadline;
    }

    fn do_session_input(&mut self, id: SessionId) {
        let max_bytes = {
            let session = self.sessions.get(&id).unwrap();
            match session.input_policy() {
                Some((p, h)) => p.lock().map(|mut p| p.get_max_transfer_chunk_size(*h)).unwrap_or(0),
                None => usize::MAX,
            }
        };

        struct Forwarder<'a> {
            callbacks: &'a mut dyn crate::session::SessionCallbacks,
            replies: std::collections::VecDeque<crate::message::Message>,
        }
        impl<'a> crate::gateway::MessageReceiver for Forwarder<'a> {
            fn message_received(&mut self, msg: crate::message::Message) {
                let mut outgoing = crate::session::OutgoingMessages::new(&mut self.replies);
                self.callbacks.message_received(msg, &mut outgoing);
            }
        }

        let session = self.sessions.get_mut(&id).unwrap();
        let (gw, callbacks) = session.split_gateway_and_callbacks().unwrap();
        let mut forwarder = Forwarder {
            callbacks,
            replies: std::collections::VecDeque::new(),
        };
        let result = gw.do_input(&mut forwarder, max_bytes);
        for reply in forwarder.replies {
            gw.add_outgoing_message(reply);
        }

        if let Some((p, h)) = session.input_policy() {
            if let Ok(mut p) = p.lock() {
                p.bytes_transferred(*h, result.byte_count() as usize);
            }
        }
        if result.is_error() {
            error!(session_id = id.as_u64(), status = ?result.status(), "session input error");
            self.disconnect_session(id);
        }
    }

    fn do_session_output(&mut self, id: SessionId, now: Instant) {
        let max_bytes = {
            let session = self.sessions.get(&id).unwrap();
            match session.output_policy() {
                Some((p, h)) => p.lock().map(|mut p| p.get_max_transfer_chunk_size(*h)).unwrap_or(0),
                None => usize::MAX,
            }
        };
        let session = self.sessions.get_mut(&id).unwrap();
        let gw = session.gateway_mut().unwrap();
        let result = gw.do_output(max_bytes);

        if let Some((p, h)) = session.output_policy() {
            if let Ok(mut p) = p.lock() {
                p.bytes_transferred(*h, result.byte_count() as usize);
            }
        }
        if result.byte_count() > 0 {
            session.note_output_activity(now);
        }
        if result.is_error() {
            error!(session_id = id.as_u64(), status = ?result.status(), "session output error");
            self.disconnect_session(id);
        }
    }

    fn disconnect_session(&mut self, id: SessionId) {
        // One final output attempt per §4.8 step 7 / §7, then consult
        // the application's graceful-disconnect callback. Does not touch
        // the multiplexer itself: the session isn't removed from `sessions`
        // here, only queued onto `lame_duck_sessions`, so forgetting its
        // fd(s) happens in `drain_lame_duck_lists` alongside the removal.
        if let Some(session) = self.sessions.get_mut(&id) {
            if let Some(gw) = session.gateway_mut() {
                let _ = gw.do_output(usize::MAX);
            }
            if session.handle_connection_closed() {
                self.lame_duck_sessions.push(id);
            }
        }
    }

    /// Step 10: factory accept pass.
    fn accept_pass(&mut self) {
        let addrs: Vec<SocketAddr> = self.factories.keys().copied().collect();
        for addr in addrs {
            let ready = self
                .factories
                .get(&addr)
                .map(|f| self.mux.is_ready_for_read(f.listen_fd()))
                .unwrap_or(false);
            if !ready {
                continue;
            }
            let accepted = match self.factories.get_mut(&addr) {
                Some(factory) => factory.try_accept(),
                None => continue,
            };
            match accepted {
                Ok(Some((mut session, stream))) => match TcpDataIo::new(stream) {
                    Ok(data_io) => {
                        let gateway = IoGateway::new(Box::new(data_io));
                        session.attach_connected(gateway);
                        info!(session_id = session.id().as_u64(), %addr, "accepted connection");
                        self.add_session(session);
                    }
                    Err(e) => error!(%addr, status = ?e, "failed to wrap accepted socket"),
                },
                Ok(None) => {}
                Err(e) => warn!(%addr, status = ?e, "accept() failed; factory remains live"),
            }
        }
    }

    /// Runs exactly one iteration of the 11-step loop (§4.8).
    pub fn run_one_iteration(&mut self) -> crate::status::StatusResult<()> {
        self.drain_lame_duck_lists(); // 1
        let now = Instant::now();
        let deadline = self.compute_next_wakeup(now); // 2

        self.register_interest(); // 3
        self.for_each_distinct_policy(|p| {
            if let Ok(mut p) = p.lock() {
                p.begin_io(now);
            }
        }); // 4

        self.mux.wait_for_events(Some(deadline))?; // 5

        self.check_oom(); // 6
        self.pump_session_io(deadline); // 7, 8

        self.for_each_distinct_policy(|p| {
            if let Ok(mut p) = p.lock() {
                p.end_io(Instant::now());
            }
        }); // 9

        self.accept_pass(); // 10
        Ok(())
    }

    /// Runs iterations until `request_shutdown` has been called (§4.8
    /// step 11).
    pub fn run(&mut self) -> crate::status::StatusResult<()> {
        while !self.shutdown_requested {
            self.run_one_iteration()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::session::SessionCallbacks;
    use std::sync::mpsc;

    struct EchoCallbacks {
        sender: mpsc::Sender<Message>,
    }
    impl SessionCallbacks for EchoCallbacks {
        fn message_received(&mut self, msg: Message, outgoing: &mut crate::session::OutgoingMessages) {
            let _ = self.sender.send(msg.clone());
            outgoing.send(msg);
        }
    }

    #[test]
    fn echo_server_round_trips_a_message() {
        let mut server = ReflectServer::new(ReactorConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel();

        let (factory, port) = SessionFactory::bind(
            "127.0.0.1:0".parse().unwrap(),
            Box::new(move |_peer| {
                Box::new(EchoCallbacks { sender: tx.clone() }) as Box<dyn SessionCallbacks>
            }),
        )
        .unwrap();
        let addr = factory.local_addr().unwrap();
        server.add_factory(addr, factory);

        let client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut client_io = TcpDataIo::new(client).unwrap();
        let mut msg = Message::new(42);
        let bytes = msg.flatten();
        assert_eq!(bytes.len(), 12);

        for _ in 0..20 {
            server.run_one_iteration().unwrap();
            if server.session_count() > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(server.session_count(), 1);

        let mut framed = Vec::new();
        framed.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        framed.extend_from_slice(&crate::message::DEFAULT_ENCODING_TAG.to_le_bytes());
        framed.extend_from_slice(&bytes);
        let mut written = 0;
        while written < framed.len() {
            let r = client_io.write(&framed[written..]);
            written += r.byte_count() as usize;
        }

        for _ in 0..50 {
            server.run_one_iteration().unwrap();
            if rx.try_recv().is_ok() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("server never received the echoed message");
    }
}
