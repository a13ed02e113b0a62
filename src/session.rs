//! Per-connection session state: one gateway, one data-I/O, a lifecycle
//! state machine, and the policy/stall/reconnect bookkeeping the reactor
//! consults each cycle (§3 "Session", §4.7).

use crate::gateway::IoGateway;
use crate::message::Message;
use crate::policy::{HolderId, IoPolicy};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A process-unique session id: high bits from wall-clock seconds at
/// server start mixed with a monotonic counter and a random component, so
/// ids neither collide within a process nor repeat across restarts in
/// practice (§3 "Session").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

impl SessionId {
    pub fn next() -> Self {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        let random: u16 = rand::thread_rng().gen();
        // wall clock: top 32 bits, counter: next 16 bits, random: low 16 bits.
        SessionId(((wall & 0xFFFF_FFFF) << 32) | ((counter & 0xFFFF) << 16) | random as u64)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Zero-padded decimal rendering used as the reflector's node name
    /// (§6 "Session IDs").
    pub fn to_padded_string(self) -> String {
        format!("{:020}", self.0)
    }
}

/// Lifecycle state of a [`Session`] (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unattached,
    Connecting,
    Connected,
    Dormant,
    LameDuck,
}

/// Handle passed to [`SessionCallbacks::message_received`] so a callback can
/// enqueue replies on its own session without an external handle to the
/// gateway or the reactor (data flow: "session callback → (optionally)
/// outgoing messages → gateway", §4.6, §4.7). Queued messages are handed to
/// the gateway's outgoing queue once the current input pass completes.
pub struct OutgoingMessages<'a> {
    queue: &'a mut VecDeque<Message>,
}

impl<'a> OutgoingMessages<'a> {
    pub(crate) fn new(queue: &'a mut VecDeque<Message>) -> Self {
        OutgoingMessages { queue }
    }

    /// Enqueues `msg` to be written out on this session's gateway.
    pub fn send(&mut self, msg: Message) {
        self.queue.push_back(msg);
    }
}

/// Application-level callbacks a [`Session`] dispatches into. Kept as a
/// trait rather than a concrete struct so embedding applications supply
/// their own behavior without subclassing (§9 "Polymorphism").
pub trait SessionCallbacks: Send {
    /// Delivers one decoded incoming message. `outgoing` lets the callback
    /// queue a reply on this same session without reaching back into the
    /// reactor or gateway.
    fn message_received(&mut self, msg: Message, outgoing: &mut OutgoingMessages);

    /// Called when the underlying connection closes. Returning `true`
    /// accepts detachment (the session is torn down); returning `false`
    /// requests a reconnect attempt instead (§4.7).
    fn client_connection_closed(&mut self) -> bool {
        true
    }

    fn async_connect_completed(&mut self) {}
}

/// Per-connection state: one gateway (hence one data-I/O), lifecycle
/// state, and the scheduling/policy fields the reactor reads each cycle
/// (§3 "Session", §4.7, §4.8).
pub struct Session {
    id: SessionId,
    state: SessionState,
    gateway: Option<IoGateway>,
    callbacks: Box<dyn SessionCallbacks>,
    hostname: String,
    auto_reconnect_delay: Option<Duration>,
    async_connect_deadline: Option<Instant>,
    last_output_at: Option<Instant>,
    stall_limit: Option<Duration>,
    pending_output_started_at: Option<Instant>,
    input_policy: Option<(Arc<Mutex<dyn IoPolicy>>, HolderId)>,
    output_policy: Option<(Arc<Mutex<dyn IoPolicy>>, HolderId)>,
    was_connected: bool,
    expendable: bool,
}

impl Session {
    pub fn new(hostname: impl Into<String>, callbacks: Box<dyn SessionCallbacks>) -> Self {
        Session {
            id: SessionId::next(),
            state: SessionState::Unattached,
            gateway: None,
            callbacks,
            hostname: hostname.into(),
            auto_reconnect_delay: None,
            async_connect_deadline: None,
            last_output_at: None,
            stall_limit: None,
            pending_output_started_at: None,
            input_policy: None,
            output_policy: None,
            was_connected: false,
            expendable: true,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn gateway(&self) -> Option<&IoGateway> {
        self.gateway.as_ref()
    }

    pub fn gateway_mut(&mut self) -> Option<&mut IoGateway> {
        self.gateway.as_mut()
    }

    /// Borrows the gateway and the callbacks simultaneously, for the
    /// reactor's input pass where a decoded message must be forwarded to
    /// callbacks while the gateway itself is mid-`do_input` (§4.8 step
    /// 7). The two fields are disjoint, so this needs no unsafe code.
    pub fn split_gateway_and_callbacks(
        &mut self,
    ) -> Option<(&mut IoGateway, &mut dyn SessionCallbacks)> {
        let gateway = self.gateway.as_mut()?;
        Some((gateway, &mut *self.callbacks))
    }

    pub fn callbacks_mut(&mut self) -> &mut dyn SessionCallbacks {
        &mut *self.callbacks
    }

    pub fn set_stall_limit(&mut self, limit: Option<Duration>) {
        self.stall_limit = limit;
    }

    pub fn stall_limit(&self) -> Option<Duration> {
        self.stall_limit
    }

    pub fn set_auto_reconnect_delay(&mut self, delay: Option<Duration>) {
        self.auto_reconnect_delay = delay;
    }

    pub fn auto_reconnect_delay(&self) -> Option<Duration> {
        self.auto_reconnect_delay
    }

    pub fn set_expendable(&mut self, expendable: bool) {
        self.expendable = expendable;
    }

    pub fn is_expendable(&self) -> bool {
        self.expendable
    }

    pub fn set_input_policy(&mut self, policy: Option<(Arc<Mutex<dyn IoPolicy>>, HolderId)>) {
        self.input_policy = policy;
    }

    pub fn input_policy(&self) -> Option<&(Arc<Mutex<dyn IoPolicy>>, HolderId)> {
        self.input_policy.as_ref()
    }

    pub fn set_output_policy(&mut self, policy: Option<(Arc<Mutex<dyn IoPolicy>>, HolderId)>) {
        self.output_policy = policy;
    }

    pub fn output_policy(&self) -> Option<&(Arc<Mutex<dyn IoPolicy>>, HolderId)> {
        self.output_policy.as_ref()
    }

    /// §4.7 "accept"/"outgoing connect finalized": attaches the owning
    /// gateway and marks the session connected.
    pub fn attach_connected(&mut self, gateway: IoGateway) {
        self.gateway = Some(gateway);
        self.state = SessionState::Connected;
        self.was_connected = true;
        self.callbacks.async_connect_completed();
    }

    pub fn begin_connecting(&mut self, deadline: Option<Instant>) {
        self.state = SessionState::Connecting;
        self.async_connect_deadline = deadline;
    }

    pub fn async_connect_deadline(&self) -> Option<Instant> {
        self.async_connect_deadline
    }

    /// §4.7 "sleep-aware disconnect": every non-loopback session is
    /// disconnected and, if it has a reconnect delay, marked dormant so
    /// the reactor can schedule its reconnect on wake.
    pub fn handle_about_to_sleep(&mut self, is_loopback_peer: bool) {
        if is_loopback_peer {
            return;
        }
        self.disconnect_for_reconnect();
    }

    fn disconnect_for_reconnect(&mut self) {
        self.gateway = None;
        self.state = if self.auto_reconnect_delay.is_some() {
            SessionState::Dormant
        } else {
            SessionState::LameDuck
        };
    }

    /// §4.7 explicit reconnect(): leaves dormant, re-enters connecting.
    pub fn reconnect(&mut self, deadline: Option<Instant>) {
        if self.state == SessionState::Dormant {
            self.begin_connecting(deadline);
        }
    }

    /// §4.7 "graceful disconnect": consults the application callback and
    /// transitions accordingly. Returns whether the session should now be
    /// moved to the lame-duck list for destruction.
    pub fn handle_connection_closed(&mut self) -> bool {
        let accept_detach = self.callbacks.client_connection_closed();
        if accept_detach {
            self.state = SessionState::LameDuck;
            true
        } else if self.auto_reconnect_delay.is_some() {
            self.disconnect_for_reconnect();
            false
        } else {
            self.state = SessionState::LameDuck;
            true
        }
    }

    pub fn note_output_activity(&mut self, now: Instant) {
        self.last_output_at = Some(now);
        self.pending_output_started_at = None;
    }

    pub fn note_output_pending_if_new(&mut self, now: Instant) {
        if self.pending_output_started_at.is_none() {
            self.pending_output_started_at = Some(now);
        }
    }

    pub fn clear_output_pending(&mut self) {
        self.pending_output_started_at = None;
    }

    /// Whether output has been pending (no bytes moved) longer than this
    /// session's stall limit (§4.8 step 8).
    pub fn is_stalled(&self, now: Instant) -> bool {
        match (self.stall_limit, self.pending_output_started_at) {
            (Some(limit), Some(started)) => now.saturating_duration_since(started) >= limit,
            _ => false,
        }
    }

    pub fn was_connected(&self) -> bool {
        self.was_connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopCallbacks {
        accept_detach: bool,
    }
    impl SessionCallbacks for NoopCallbacks {
        fn message_received(&mut self, _msg: Message, _outgoing: &mut OutgoingMessages) {}
        fn client_connection_closed(&mut self) -> bool {
            self.accept_detach
        }
    }

    #[test]
    fn session_ids_are_unique_across_many_constructions() {
        let mut ids = std::collections::HashSet::new();
        for _ in 0..1000 {
            let id = SessionId::next();
            assert!(ids.insert(id));
        }
    }

    #[test]
    fn session_id_renders_as_zero_padded_decimal() {
        let id = SessionId::next();
        let s = id.to_padded_string();
        assert_eq!(s.len(), 20);
        assert!(s.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn graceful_disconnect_with_accept_detach_goes_lame_duck() {
        let mut session = Session::new(
            "peer",
            Box::new(NoopCallbacks { accept_detach: true }),
        );
        session.state = SessionState::Connected;
        let should_remove = session.handle_connection_closed();
        assert!(should_remove);
        assert_eq!(session.state(), SessionState::LameDuck);
    }

    #[test]
    fn graceful_disconnect_with_reconnect_delay_goes_dormant() {
        let mut session = Session::new(
            "peer",
            Box::new(NoopCallbacks {
                accept_detach: false,
            }),
        );
        session.state = SessionState::Connected;
        session.set_auto_reconnect_delay(Some(Duration::from_secs(5)));
        let should_remove = session.handle_connection_closed();
        assert!(!should_remove);
        assert_eq!(session.state(), SessionState::Dormant);
    }

    #[test]
    fn sleep_disconnects_non_loopback_peers_only() {
        let mut session = Session::new("peer", Box::new(NoopCallbacks { accept_detach: true }));
        session.state = SessionState::Connected;
        session.handle_about_to_sleep(true);
        assert_eq!(session.state(), SessionState::Connected);
        session.handle_about_to_sleep(false);
        assert_ne!(session.state(), SessionState::Connected);
    }

    #[test]
    fn stall_detection_fires_after_the_configured_limit() {
        let mut session = Session::new("peer", Box::new(NoopCallbacks { accept_detach: true }));
        session.set_stall_limit(Some(Duration::from_millis(100)));
        let t0 = Instant::now();
        session.note_output_pending_if_new(t0);
        assert!(!session.is_stalled(t0));
        assert!(session.is_stalled(t0 + Duration::from_millis(150)));
    }
}
