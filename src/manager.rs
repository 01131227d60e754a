//! The fixed-tick command frame scheduler.
//!
//! A [`CommandFrameManager`] owns the frame counters, the input ring, the
//! attribute snapshot buffer, the time dilation controller and one
//! [`NetChannel`] per player. Every fixed frame runs three stages:
//!
//! 1. **End of the previous frame.** A client records the input captured
//!    during that frame, sends its redundant input window and lets its
//!    channel apply buffered deltas. Then the `PreEnd`/`End` hooks run, a
//!    dedicated server sends a delta packet to every channel, and `PostEnd`
//!    runs.
//! 2. **Advance.** The internal frame always moves forward; the real frame
//!    only outside a replay.
//! 3. **Begin of the new frame.** `PreBegin`/`Begin` run, a dedicated server
//!    consumes the buffered input for the real frame, a client advances its
//!    time dilation controller, and `PostBegin` runs.
//!
//! A replay re-runs stages 3, input simulation, 1 and 2 for every frame after
//! the rewind point without touching real time.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};
use web_time::Instant;

use crate::buffer::input_frame::InputFrame;
use crate::buffer::ownership_queue::OwnershipCircularQueue;
use crate::buffer::snapshot::SnapshotBuffer;
use crate::hooks::{FrameHooks, FramePhase, FrameTick, HookHandle};
use crate::input::atom::{ActionId, ActionRef, NetHandle};
use crate::input::binding::InputStack;
use crate::input::source::{CommandInputQueue, InputSource};
use crate::network::channel::{ChannelHost, NetChannel};
use crate::network::packet::{DeltaNetPacket, DeltaPacketType, InputNetPacket, OwnerFrameAllocator};
use crate::network::transport::ChannelTransport;
use crate::telemetry::{
    InvariantChecker, InvariantViolation, ViolationKind, ViolationObserver, ViolationSeverity,
};
use crate::time_dilation::TimeDilation;
use crate::{
    debug_check_invariants, report_violation_to, CommandFrame, CommandFrameConfig,
    CommandFrameError, NetMode, OwnerId,
};

/// Token returned by [`CommandFrameManager::bind_on_channel_registered`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerHandle(u64);

type ChannelListener = Box<dyn FnMut(OwnerId)>;

struct ChannelSubscription {
    // `None` listens for every owner.
    owner: Option<OwnerId>,
    callback: ChannelListener,
}

/// Drives the command frame loop for one session. See the [module docs](self).
///
/// The manager is generic over its [`InputSource`]; the default
/// [`CommandInputQueue`] is reachable through
/// [`input_source_mut`](Self::input_source_mut) for recording local input.
pub struct CommandFrameManager<S: InputSource = CommandInputQueue> {
    mode: NetMode,
    config: CommandFrameConfig,
    initialized: bool,

    /// The newest frame this process has advanced to.
    real_command_frame: CommandFrame,
    /// The frame currently being simulated; behind RCF only during a replay.
    internal_command_frame: CommandFrame,
    /// RCF as of the last end-of-frame stage.
    prev_command_frame: CommandFrame,

    accumulated_seconds: f32,
    last_tick: Option<Instant>,
    local_ping_ms: f32,

    /// Client: the local player's recorded input. Server: every client's received input.
    input_buffer: OwnershipCircularQueue<InputFrame>,
    snapshot_buffer: SnapshotBuffer,
    time_dilation: TimeDilation,
    hooks: FrameHooks,

    input_source: S,
    players: BTreeMap<OwnerId, InputStack>,
    replicated_actions: BTreeMap<NetHandle, ActionId>,

    channels: BTreeMap<OwnerId, NetChannel>,
    /// Client only: the player this process records input for.
    local_owner: Option<OwnerId>,
    channel_listeners: BTreeMap<ListenerHandle, ChannelSubscription>,
    next_listener_id: u64,

    /// Optional observer for violations; falls back to tracing when `None`.
    violation_observer: Option<Arc<dyn ViolationObserver>>,
}

impl<S: InputSource> fmt::Debug for CommandFrameManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandFrameManager")
            .field("mode", &self.mode)
            .field("initialized", &self.initialized)
            .field("real_command_frame", &self.real_command_frame)
            .field("internal_command_frame", &self.internal_command_frame)
            .field("prev_command_frame", &self.prev_command_frame)
            .field("accumulated_seconds", &self.accumulated_seconds)
            .field("input_buffer", &self.input_buffer)
            .field("time_dilation", &self.time_dilation)
            .field("channels", &self.channels)
            .field("local_owner", &self.local_owner)
            .finish_non_exhaustive()
    }
}

impl CommandFrameManager<CommandInputQueue> {
    /// Creates an initialized manager fed by a [`CommandInputQueue`].
    ///
    /// # Errors
    ///
    /// Returns [`CommandFrameError::InvalidConfig`] if `config` fails validation.
    pub fn new(mode: NetMode, config: CommandFrameConfig) -> Result<Self, CommandFrameError> {
        Self::with_input_source(mode, config, CommandInputQueue::new())
    }
}

impl<S: InputSource> CommandFrameManager<S> {
    /// Creates an initialized manager fed by `input_source`.
    ///
    /// # Errors
    ///
    /// Returns [`CommandFrameError::InvalidConfig`] if `config` fails validation.
    pub fn with_input_source(
        mode: NetMode,
        config: CommandFrameConfig,
        input_source: S,
    ) -> Result<Self, CommandFrameError> {
        config.validate()?;
        debug!(?mode, fixed_frame_rate = config.fixed_frame_rate, "creating command frame manager");
        Ok(Self {
            mode,
            config,
            initialized: true,
            real_command_frame: CommandFrame::ZERO,
            internal_command_frame: CommandFrame::ZERO,
            prev_command_frame: CommandFrame::ZERO,
            accumulated_seconds: 0.0,
            last_tick: None,
            local_ping_ms: 0.0,
            input_buffer: OwnershipCircularQueue::new(config.max_buffered_frames),
            snapshot_buffer: SnapshotBuffer::new(config.max_snapshot_frames),
            time_dilation: TimeDilation::new(&config),
            hooks: FrameHooks::new(),
            input_source,
            players: BTreeMap::new(),
            replicated_actions: BTreeMap::new(),
            channels: BTreeMap::new(),
            local_owner: None,
            channel_listeners: BTreeMap::new(),
            next_listener_id: 0,
            violation_observer: None,
        })
    }

    /// Sets the violation observer and returns the manager.
    #[must_use]
    pub fn with_violation_observer(mut self, observer: Arc<dyn ViolationObserver>) -> Self {
        self.set_violation_observer(observer);
        self
    }

    /// Routes violations from the manager and its channels to `observer`.
    pub fn set_violation_observer(&mut self, observer: Arc<dyn ViolationObserver>) {
        for channel in self.channels.values_mut() {
            channel.attach(Some(observer.clone()));
        }
        self.violation_observer = Some(observer);
    }

    /// Returns the violation observer, if one was set.
    #[must_use]
    pub fn violation_observer(&self) -> Option<&Arc<dyn ViolationObserver>> {
        self.violation_observer.as_ref()
    }

    // #############
    // # LIFECYCLE #
    // #############

    /// Re-opens a manager after [`shutdown`](Self::shutdown). Does nothing if already running.
    pub fn initialize(&mut self) {
        if self.initialized {
            return;
        }
        debug!(mode = ?self.mode, "command frame manager initialized");
        self.initialized = true;
    }

    /// Drops every channel, player, hook and listener and resets all frame state.
    pub fn shutdown(&mut self) {
        debug!(
            mode = ?self.mode,
            rcf = %self.real_command_frame,
            channels = self.channels.len(),
            "command frame manager shutting down"
        );
        self.channels.clear();
        self.players.clear();
        self.replicated_actions.clear();
        self.channel_listeners.clear();
        self.hooks.clear();
        self.local_owner = None;

        self.input_buffer = OwnershipCircularQueue::new(self.config.max_buffered_frames);
        self.snapshot_buffer = SnapshotBuffer::new(self.config.max_snapshot_frames);
        self.input_source.clear_input();
        self.time_dilation.reset();

        self.real_command_frame = CommandFrame::ZERO;
        self.internal_command_frame = CommandFrame::ZERO;
        self.prev_command_frame = CommandFrame::ZERO;
        self.accumulated_seconds = 0.0;
        self.last_tick = None;
        self.initialized = false;
    }

    /// Returns `true` between [`initialize`](Self::initialize) and [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Returns `true` if fixed frames can run. A client needs a local owner first.
    #[must_use]
    pub fn is_prepared(&self) -> bool {
        match self.mode {
            NetMode::Client => self.local_owner.is_some(),
            NetMode::DedicatedServer | NetMode::Standalone => true,
        }
    }

    // #############
    // # ACCESSORS #
    // #############

    /// Which side of the connection this manager runs on.
    #[must_use]
    pub fn mode(&self) -> NetMode {
        self.mode
    }

    /// The configuration the manager was created with.
    #[must_use]
    pub fn config(&self) -> &CommandFrameConfig {
        &self.config
    }

    /// The real command frame (RCF).
    #[must_use]
    pub fn real_command_frame(&self) -> CommandFrame {
        self.real_command_frame
    }

    /// The internal command frame (ICF).
    #[must_use]
    pub fn internal_command_frame(&self) -> CommandFrame {
        self.internal_command_frame
    }

    /// RCF as of the last end-of-frame stage.
    #[must_use]
    pub fn prev_command_frame(&self) -> CommandFrame {
        self.prev_command_frame
    }

    /// Returns `true` while a replay is in progress.
    #[must_use]
    pub fn is_rewinding(&self) -> bool {
        self.internal_command_frame < self.real_command_frame
    }

    /// The client's local player, once registered.
    #[must_use]
    pub fn local_owner(&self) -> Option<OwnerId> {
        self.local_owner
    }

    /// The time dilation controller.
    #[must_use]
    pub fn time_dilation(&self) -> &TimeDilation {
        &self.time_dilation
    }

    /// The input ring.
    #[must_use]
    pub fn input_buffer(&self) -> &OwnershipCircularQueue<InputFrame> {
        &self.input_buffer
    }

    /// Frames of `owner`'s input still buffered.
    #[must_use]
    pub fn buffered_frames(&self, owner: OwnerId) -> u32 {
        self.input_buffer.count_owner(&owner)
    }

    /// The input source.
    #[must_use]
    pub fn input_source(&self) -> &S {
        &self.input_source
    }

    /// The input source, e.g. for recording local input.
    pub fn input_source_mut(&mut self) -> &mut S {
        &mut self.input_source
    }

    /// Updates the round-trip time fed to the time dilation controller.
    pub fn set_local_ping(&mut self, ping_ms: f32) {
        self.local_ping_ms = ping_ms;
    }

    // #########
    // # HOOKS #
    // #########

    /// Subscribes `callback` to `phase`. See [`FrameHooks::subscribe`].
    pub fn subscribe(
        &mut self,
        phase: FramePhase,
        callback: impl FnMut(&FrameTick) + 'static,
    ) -> HookHandle {
        self.hooks.subscribe(phase, callback)
    }

    /// Removes a hook. Returns `false` if it was already gone.
    pub fn unsubscribe(&mut self, handle: &HookHandle) -> bool {
        self.hooks.unsubscribe(handle)
    }

    /// The registered frame hooks.
    #[must_use]
    pub fn hooks(&self) -> &FrameHooks {
        &self.hooks
    }

    // ###########
    // # PLAYERS #
    // ###########

    /// The binding stack of `owner`, created on first access.
    pub fn player_input_stack_mut(&mut self, owner: OwnerId) -> &mut InputStack {
        self.players.entry(owner).or_default()
    }

    /// Resolves atoms carrying `handle` to `action`.
    pub fn register_replicated_action(&mut self, handle: NetHandle, action: ActionId) {
        self.replicated_actions.insert(handle, action);
    }

    /// Forgets a replicated handle. Returns the action it resolved to.
    pub fn unregister_replicated_action(&mut self, handle: NetHandle) -> Option<ActionId> {
        self.replicated_actions.remove(&handle)
    }

    // ############
    // # CHANNELS #
    // ############

    /// Server: a player joined. Creates its channel, or re-points an existing
    /// one to `transport`, then notifies channel listeners.
    pub fn post_login(&mut self, owner: OwnerId, transport: Box<dyn ChannelTransport>) {
        if let Some(channel) = self.channels.get_mut(&owner) {
            debug!(%owner, "re-pointing existing channel to a new transport");
            channel.set_transport(transport);
        } else {
            debug!(%owner, "player logged in, creating channel");
            self.insert_channel(owner, transport);
        }
        self.players.entry(owner).or_default();
        self.broadcast_channel_registered(owner);
    }

    /// A player left. Removes its channel and binding stack.
    ///
    /// Returns `false` if no channel was registered for `owner`.
    pub fn logout(&mut self, owner: OwnerId) -> bool {
        let removed = self.channels.remove(&owner).is_some();
        self.players.remove(&owner);
        if self.local_owner == Some(owner) {
            self.local_owner = None;
        }
        debug!(%owner, removed, "player logged out");
        removed
    }

    /// Client: registers the local player's channel. The manager becomes prepared.
    pub fn register_client_channel(&mut self, owner: OwnerId, transport: Box<dyn ChannelTransport>) {
        debug!(%owner, "registering local client channel");
        self.local_owner = Some(owner);
        match self.channels.get_mut(&owner) {
            Some(channel) => channel.set_transport(transport),
            None => self.insert_channel(owner, transport),
        }
        self.players.entry(owner).or_default();
        self.broadcast_channel_registered(owner);
    }

    /// The channel of `owner`.
    #[must_use]
    pub fn channel(&self, owner: OwnerId) -> Option<&NetChannel> {
        self.channels.get(&owner)
    }

    /// The channel of `owner`, e.g. for registering packet procedures.
    pub fn channel_mut(&mut self, owner: OwnerId) -> Option<&mut NetChannel> {
        self.channels.get_mut(&owner)
    }

    /// Number of registered channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Calls `callback` whenever a channel is registered for `owner`, or for
    /// any owner if `None`. If `owner`'s channel already exists the callback
    /// fires immediately.
    pub fn bind_on_channel_registered(
        &mut self,
        owner: Option<OwnerId>,
        callback: impl FnMut(OwnerId) + 'static,
    ) -> ListenerHandle {
        let handle = ListenerHandle(self.next_listener_id);
        self.next_listener_id = self.next_listener_id.wrapping_add(1);

        let mut callback: ChannelListener = Box::new(callback);
        if let Some(owner) = owner {
            if self.channels.contains_key(&owner) {
                callback(owner);
            }
        }
        self.channel_listeners
            .insert(handle, ChannelSubscription { owner, callback });
        handle
    }

    /// Removes a channel listener. Returns `false` if it was already gone.
    pub fn unbind_on_channel_registered(&mut self, handle: ListenerHandle) -> bool {
        self.channel_listeners.remove(&handle).is_some()
    }

    fn insert_channel(&mut self, owner: OwnerId, transport: Box<dyn ChannelTransport>) {
        let mut channel = NetChannel::new(owner, transport);
        channel.attach(self.violation_observer.clone());
        self.channels.insert(owner, channel);
    }

    fn broadcast_channel_registered(&mut self, owner: OwnerId) {
        for subscription in self.channel_listeners.values_mut() {
            if subscription.owner.map_or(true, |wanted| wanted == owner) {
                (subscription.callback)(owner);
            }
        }
    }

    /// Server: feeds an input packet received from `owner` through its channel.
    ///
    /// # Errors
    ///
    /// Returns [`CommandFrameError::UnknownChannel`] if `owner` has no channel.
    pub fn server_receive_input(
        &mut self,
        owner: OwnerId,
        packet: &InputNetPacket,
    ) -> Result<(), CommandFrameError> {
        let mut channel = self
            .channels
            .remove(&owner)
            .ok_or(CommandFrameError::UnknownChannel { owner })?;
        channel.server_receive_input(self, packet);
        self.channels.insert(owner, channel);
        Ok(())
    }

    /// Client: feeds a delta packet received on `owner`'s channel. May replay frames.
    ///
    /// # Errors
    ///
    /// Returns [`CommandFrameError::UnknownChannel`] if `owner` has no channel.
    pub fn client_receive_delta(
        &mut self,
        owner: OwnerId,
        packet: DeltaNetPacket,
    ) -> Result<(), CommandFrameError> {
        let mut channel = self
            .channels
            .remove(&owner)
            .ok_or(CommandFrameError::UnknownChannel { owner })?;
        channel.client_receive_delta(self, packet);
        self.channels.insert(owner, channel);
        Ok(())
    }

    /// Runs `f` with the channel map moved out, so channels can call back into the manager.
    fn with_channels(&mut self, f: impl FnOnce(&mut Self, &mut BTreeMap<OwnerId, NetChannel>)) {
        let mut channels = std::mem::take(&mut self.channels);
        f(self, &mut channels);
        channels.append(&mut self.channels);
        self.channels = channels;
    }

    // #############
    // # SNAPSHOTS #
    // #############

    /// Records `value` as the `T` attribute of `frame`.
    ///
    /// Returns `false` if `frame` is too old or already has a `T`.
    pub fn record_attribute_snapshot<T: 'static>(&mut self, frame: CommandFrame, value: T) -> bool {
        self.snapshot_buffer.record_attribute_snapshot(frame, value)
    }

    /// The `T` attribute recorded for `frame`.
    #[must_use]
    pub fn read_attribute_from_snapshot<T: 'static>(&self, frame: CommandFrame) -> Option<&T> {
        self.snapshot_buffer.read_attribute_from_snapshot(frame)
    }

    /// The attribute snapshot buffer.
    #[must_use]
    pub fn snapshot_buffer(&self) -> &SnapshotBuffer {
        &self.snapshot_buffer
    }

    // ##############
    // # FRAME LOOP #
    // ##############

    /// Advances the scheduler by `real_delta_seconds` of wall time.
    ///
    /// The elapsed time is scaled by the current time dilation and converted
    /// into as many fixed frames as it covers, up to
    /// [`max_fixed_frames_per_tick`](CommandFrameConfig::max_fixed_frames_per_tick).
    /// Time left over beyond that bound is dropped and reported.
    pub fn flush_command_frame(&mut self, real_delta_seconds: f32) {
        if !self.initialized || !self.config.enabled {
            return;
        }
        if !self.is_prepared() {
            trace!(mode = ?self.mode, "manager not prepared, skipping flush");
            return;
        }

        let fixed_delta = self.config.fixed_delta_seconds();
        self.accumulated_seconds +=
            real_delta_seconds.max(0.0) * self.time_dilation.current_dilation();
        trace!(
            real_delta_seconds,
            accumulated = self.accumulated_seconds,
            "flushing command frames"
        );

        let max_frames = self.config.max_fixed_frames_per_tick;
        let mut frames_run = 0u32;
        while self.accumulated_seconds > fixed_delta && frames_run < max_frames {
            self.accumulated_seconds -= fixed_delta;
            frames_run += 1;
            self.flush_fixed_frame(fixed_delta);
        }

        if self.accumulated_seconds > fixed_delta {
            let dropped = self.accumulated_seconds;
            self.accumulated_seconds = 0.0;
            report_violation_to!(
                self.violation_observer,
                self.real_command_frame,
                ViolationSeverity::Warning,
                ViolationKind::Scheduler,
                "fixed frame budget of {} exceeded, dropping {:.3}s of accumulated time",
                max_frames,
                dropped
            );
        }
    }

    /// Advances the scheduler by the wall time elapsed since the previous call.
    /// The first call only records `now`.
    pub fn tick(&mut self, now: Instant) {
        let elapsed = self
            .last_tick
            .replace(now)
            .map_or(0.0, |last| now.duration_since(last).as_secs_f32());
        self.flush_command_frame(elapsed);
    }

    fn flush_fixed_frame(&mut self, delta_time: f32) {
        self.end_prev_frame(delta_time);
        self.advance_frame();
        self.begin_new_frame(delta_time);
        debug_check_invariants!(self, "after fixed frame");
    }

    fn frame_tick(&self, delta_time: f32) -> FrameTick {
        FrameTick {
            delta_time,
            real_frame: self.real_command_frame,
            internal_frame: self.internal_command_frame,
        }
    }

    fn end_prev_frame(&mut self, delta_time: f32) {
        self.prev_command_frame = self.real_command_frame;

        // frame 0 has nothing to finish
        if self.real_command_frame.is_zero() {
            return;
        }

        let rewinding = self.is_rewinding();
        if self.mode.is_client() && !rewinding {
            self.record_command_snapshot();
            self.client_send_input();
            self.tick_channels();
        }

        let tick = self.frame_tick(delta_time);
        self.hooks.broadcast(FramePhase::PreEnd, &tick);
        self.hooks.broadcast(FramePhase::End, &tick);

        if self.mode.is_dedicated_server() && !self.is_rewinding() {
            self.server_send_deltas();
        }

        self.hooks.broadcast(FramePhase::PostEnd, &tick);
    }

    fn advance_frame(&mut self) {
        if !self.is_rewinding() {
            self.real_command_frame += 1;
        }
        self.internal_command_frame += 1;
    }

    fn begin_new_frame(&mut self, delta_time: f32) {
        let tick = self.frame_tick(delta_time);
        self.hooks.broadcast(FramePhase::PreBegin, &tick);
        self.hooks.broadcast(FramePhase::Begin, &tick);

        if !self.is_rewinding() {
            match self.mode {
                NetMode::DedicatedServer => self.consume_input(),
                NetMode::Client => self
                    .time_dilation
                    .fixed_tick(delta_time, self.local_ping_ms),
                NetMode::Standalone => {},
            }
        }

        self.hooks.broadcast(FramePhase::PostBegin, &tick);
    }

    /// Client: drains the input source into the ring at RCF.
    fn record_command_snapshot(&mut self) {
        let Some(owner) = self.local_owner else {
            return;
        };
        let frame = self.real_command_frame;
        let input_num = self.input_source.input_num();
        match self.input_buffer.allocate_item_data(owner, input_num, frame) {
            Some(slot) => {
                let written = self.input_source.pop_inputs_into(slot);
                trace!(%owner, %frame, written, "recorded local input");
            },
            None => {
                trace!(%owner, %frame, "input for frame already recorded or too old");
            },
        }
    }

    /// Client: sends the newest redundant window ending at RCF.
    fn client_send_input(&mut self) {
        let Some(owner) = self.local_owner else {
            return;
        };
        let redundant = self
            .input_buffer
            .count()
            .min(self.config.max_redundant_frames);
        let view = self
            .input_buffer
            .read_range_data_shrink(self.real_command_frame, redundant);
        if view.is_empty() {
            return;
        }
        let packet = match InputNetPacket::build_from_view(view) {
            Ok(packet) => packet,
            Err(err) => {
                report_violation_to!(
                    self.violation_observer,
                    self.real_command_frame,
                    ViolationSeverity::Error,
                    ViolationKind::Serialization,
                    "failed to encode input packet: {}",
                    err
                );
                return;
            },
        };
        trace!(%owner, client_frame = %packet.client_command_frame, bytes = packet.raw_data.len(), "sending input packet");
        if let Some(channel) = self.channels.get_mut(&owner) {
            channel.client_send_input(&packet);
        }
    }

    fn tick_channels(&mut self) {
        self.with_channels(|manager, channels| {
            for channel in channels.values_mut() {
                channel.fixed_tick(manager);
            }
        });
    }

    fn server_send_deltas(&mut self) {
        let frame = self.real_command_frame;
        self.with_channels(|manager, channels| {
            for channel in channels.values_mut() {
                channel.server_send_delta(&*manager, frame, DeltaPacketType::NONE);
            }
        });
    }

    /// Server: simulates RCF from the buffered input, then acknowledges it.
    fn consume_input(&mut self) {
        let frame = self.real_command_frame;
        self.simulate_input(frame);

        if !self.input_buffer.is_empty() && self.input_buffer.head_frame() == frame {
            self.input_buffer.ack_next_data();
        } else if frame < self.input_buffer.end_frame() {
            self.input_buffer.ack_data(frame);
        } else {
            // everything buffered is stale; later writes at or before `frame` are rejected
            self.input_buffer.ack_data(frame + 1);
        }
    }

    /// Invokes every player binding that matches an atom buffered for `frame`.
    ///
    /// Players are visited in the order they wrote into the frame; each
    /// player's atoms in recording order.
    pub fn simulate_input(&mut self, frame: CommandFrame) {
        if let Some(input_frame) = self.input_buffer.read_data(frame) {
            let bindings: BTreeMap<OwnerId, _> = self
                .players
                .iter()
                .map(|(owner, stack)| (*owner, stack.action_bindings()))
                .collect();

            let atoms = input_frame.atoms();
            let mut offset = 0usize;
            for (owner, count) in input_frame.owners() {
                let count = count as usize;
                let owner_atoms = atoms.get(offset..offset + count).unwrap_or_default();
                offset += count;

                let (Some(action_bindings), Some(stack)) =
                    (bindings.get(&owner), self.players.get_mut(&owner))
                else {
                    continue;
                };
                if action_bindings.is_empty() {
                    continue;
                }

                for atom in owner_atoms {
                    let action = match atom.action {
                        ActionRef::Local(action) => Some(action),
                        ActionRef::Replicated(handle) => {
                            self.replicated_actions.get(&handle).copied()
                        },
                    };
                    let Some(slots) = action.and_then(|action| action_bindings.get(&action)) else {
                        continue;
                    };
                    for slot in slots {
                        stack.invoke(*slot, atom);
                    }
                }
            }
        } else {
            trace!(%frame, "no buffered input to simulate");
        }

        // a client's pending input belongs to the frame being captured, not the one replayed
        if !self.mode.is_client() {
            self.input_source.clear_input();
        }
    }

    /// Re-simulates every frame after `rewound_frame` up to RCF.
    ///
    /// Callers restore their state to `rewound_frame` first. Each replayed
    /// frame runs the begin hooks, input simulation and the end hooks with
    /// [`FrameTick::is_rewinding`] set; RCF itself runs begin and input
    /// simulation only, as its end stage belongs to the next real frame.
    pub fn replay_frames(&mut self, rewound_frame: CommandFrame) {
        if rewound_frame >= self.real_command_frame {
            trace!(%rewound_frame, rcf = %self.real_command_frame, "nothing to replay");
            return;
        }
        debug!(%rewound_frame, rcf = %self.real_command_frame, "replaying frames");

        self.time_dilation.update_fault(true);
        let delta_time = self.config.fixed_delta_seconds();

        self.internal_command_frame = rewound_frame + 1;
        while self.internal_command_frame < self.real_command_frame {
            self.begin_new_frame(delta_time);
            self.simulate_input(self.internal_command_frame);
            self.end_prev_frame(delta_time);
            self.advance_frame();
        }

        self.internal_command_frame = self.real_command_frame;
        self.begin_new_frame(delta_time);
        self.simulate_input(self.real_command_frame);
    }

    /// Snaps RCF, ICF and the previous frame to `frame`, acknowledges
    /// buffered input up to it and empties the snapshot buffer.
    pub fn reset_command_frame(&mut self, frame: CommandFrame) {
        debug!(%frame, rcf = %self.real_command_frame, "resetting command frame");
        self.real_command_frame = frame;
        self.prev_command_frame = frame;
        self.internal_command_frame = frame;
        self.input_buffer.ack_data(frame);
        self.snapshot_buffer.empty();
    }
}

impl<S: InputSource> ChannelHost for CommandFrameManager<S> {
    fn real_command_frame(&self) -> CommandFrame {
        self.real_command_frame
    }

    fn is_rewinding(&self) -> bool {
        self.internal_command_frame < self.real_command_frame
    }

    fn receive_input(&mut self, owner: OwnerId, packet: &InputNetPacket) {
        let mut allocator = OwnerFrameAllocator::new(&mut self.input_buffer, owner);
        match packet.read_redundant_data(&mut allocator) {
            Ok(accepted) => {
                debug!(
                    %owner,
                    client_frame = %packet.client_command_frame,
                    accepted,
                    rcf = %self.real_command_frame,
                    buffered = self.input_buffer.count_owner(&owner),
                    "received input packet"
                );
            },
            Err(err) => {
                report_violation_to!(
                    self.violation_observer,
                    self.real_command_frame,
                    ViolationSeverity::Error,
                    ViolationKind::Serialization,
                    "failed to decode input packet from owner {}: {}",
                    owner,
                    err
                );
            },
        }
    }

    fn buffered_frames(&self, owner: OwnerId) -> u32 {
        self.input_buffer.count_owner(&owner)
    }

    fn reset_command_frame(&mut self, frame: CommandFrame) {
        CommandFrameManager::reset_command_frame(self, frame);
    }

    fn update_time_dilation(&mut self, buffer_depth: u32, fault: bool) {
        self.time_dilation.update(buffer_depth, fault);
    }

    fn client_receive_command_ack(&mut self, frame: CommandFrame) {
        self.input_buffer.ack_data(frame);
    }

    fn replay_frames(&mut self, frame: CommandFrame) {
        CommandFrameManager::replay_frames(self, frame);
    }
}

impl<S: InputSource> InvariantChecker for CommandFrameManager<S> {
    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.internal_command_frame > self.real_command_frame {
            return Err(InvariantViolation::new(
                "CommandFrameManager",
                "internal frame ahead of real frame",
            )
            .with_details(format!(
                "icf={}, rcf={}",
                self.internal_command_frame, self.real_command_frame
            )));
        }

        if self.prev_command_frame > self.real_command_frame {
            return Err(InvariantViolation::new(
                "CommandFrameManager",
                "previous frame ahead of real frame",
            )
            .with_details(format!(
                "prev={}, rcf={}",
                self.prev_command_frame, self.real_command_frame
            )));
        }

        self.input_buffer.check_invariants()
    }
}

// ###################
// # UNIT TESTS      #
// ###################

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::transport::LoopbackTransport;
    use crate::telemetry::CollectingObserver;
    use crate::{InputAtom, InputGroup, InputValue, TriggerEvent, MAX_FIXED_FRAMES_PER_TICK};
    use std::cell::RefCell;
    use std::rc::Rc;

    const OWNER: OwnerId = OwnerId::new(1);
    const MOVE: ActionId = ActionId::new(7);

    fn step<S: InputSource>(manager: &mut CommandFrameManager<S>) {
        // slightly over one step; the remainder stays well below a frame for short runs
        let fixed = manager.config().fixed_delta_seconds();
        manager.flush_command_frame(fixed * 1.01);
    }

    fn client() -> (CommandFrameManager, LoopbackTransport) {
        let mut manager = CommandFrameManager::new(NetMode::Client, CommandFrameConfig::default())
            .expect("valid config");
        let (client_end, server_end) = LoopbackTransport::pair();
        manager.register_client_channel(OWNER, Box::new(client_end));
        (manager, server_end)
    }

    fn move_atom(value: f32) -> InputAtom {
        InputAtom::new(MOVE, TriggerEvent::Triggered, InputValue::axis1d(value))
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = CommandFrameConfig {
            fixed_frame_rate: 0,
            ..CommandFrameConfig::default()
        };
        let err = CommandFrameManager::new(NetMode::Standalone, config).unwrap_err();
        assert!(matches!(err, CommandFrameError::InvalidConfig { .. }));
    }

    #[test]
    fn client_without_local_owner_is_not_prepared() {
        let mut manager =
            CommandFrameManager::new(NetMode::Client, CommandFrameConfig::default()).unwrap();
        assert!(!manager.is_prepared());
        manager.flush_command_frame(1.0);
        assert_eq!(manager.real_command_frame(), CommandFrame::ZERO);

        let (client_end, _server_end) = LoopbackTransport::pair();
        manager.register_client_channel(OWNER, Box::new(client_end));
        assert!(manager.is_prepared());
        step(&mut manager);
        assert_eq!(manager.real_command_frame(), CommandFrame::new(1));
    }

    #[test]
    fn disabled_manager_never_advances() {
        let config = CommandFrameConfig {
            enabled: false,
            ..CommandFrameConfig::default()
        };
        let mut manager = CommandFrameManager::new(NetMode::Standalone, config).unwrap();
        manager.flush_command_frame(0.5);
        assert_eq!(manager.real_command_frame(), CommandFrame::ZERO);
    }

    #[test]
    fn flush_runs_one_frame_per_fixed_step() {
        let mut manager =
            CommandFrameManager::new(NetMode::Standalone, CommandFrameConfig::default()).unwrap();
        let fixed = manager.config().fixed_delta_seconds();

        manager.flush_command_frame(fixed * 0.5);
        assert_eq!(manager.real_command_frame(), CommandFrame::ZERO);

        manager.flush_command_frame(fixed * 0.6);
        assert_eq!(manager.real_command_frame(), CommandFrame::new(1));

        manager.flush_command_frame(fixed * 2.5);
        assert_eq!(manager.real_command_frame(), CommandFrame::new(3));
        assert_eq!(manager.internal_command_frame(), CommandFrame::new(3));
        assert_eq!(manager.prev_command_frame(), CommandFrame::new(2));
    }

    #[test]
    fn overload_drops_accumulated_time() {
        let observer = Arc::new(CollectingObserver::new());
        let mut manager =
            CommandFrameManager::new(NetMode::Standalone, CommandFrameConfig::default())
                .unwrap()
                .with_violation_observer(observer.clone());

        manager.flush_command_frame(1.0);
        assert_eq!(
            manager.real_command_frame(),
            CommandFrame::new(MAX_FIXED_FRAMES_PER_TICK)
        );
        assert!(observer.has_violation(ViolationKind::Scheduler));

        // nothing carried over
        observer.clear();
        manager.flush_command_frame(0.0);
        assert_eq!(
            manager.real_command_frame(),
            CommandFrame::new(MAX_FIXED_FRAMES_PER_TICK)
        );
        assert!(observer.is_empty());
    }

    #[test]
    fn exact_budget_is_not_an_overload() {
        let observer = Arc::new(CollectingObserver::new());
        let mut manager =
            CommandFrameManager::new(NetMode::Standalone, CommandFrameConfig::default())
                .unwrap()
                .with_violation_observer(observer.clone());
        let fixed = manager.config().fixed_delta_seconds();

        manager.flush_command_frame(fixed * 3.5);
        assert_eq!(manager.real_command_frame(), CommandFrame::new(3));
        assert!(observer.is_empty());
    }

    #[test]
    fn hooks_run_in_phase_order() {
        let mut manager =
            CommandFrameManager::new(NetMode::Standalone, CommandFrameConfig::default()).unwrap();
        let log = Rc::new(RefCell::new(Vec::new()));
        for phase in FramePhase::ALL {
            let log = Rc::clone(&log);
            manager.subscribe(phase, move |tick| {
                log.borrow_mut().push((phase, tick.real_frame.as_u32()));
            });
        }

        step(&mut manager);
        // frame 0 has no end stage
        assert_eq!(
            *log.borrow(),
            vec![
                (FramePhase::PreBegin, 1),
                (FramePhase::Begin, 1),
                (FramePhase::PostBegin, 1),
            ]
        );

        log.borrow_mut().clear();
        step(&mut manager);
        assert_eq!(
            *log.borrow(),
            vec![
                (FramePhase::PreEnd, 1),
                (FramePhase::End, 1),
                (FramePhase::PostEnd, 1),
                (FramePhase::PreBegin, 2),
                (FramePhase::Begin, 2),
                (FramePhase::PostBegin, 2),
            ]
        );
    }

    #[test]
    fn unsubscribed_hook_stops_firing() {
        let mut manager =
            CommandFrameManager::new(NetMode::Standalone, CommandFrameConfig::default()).unwrap();
        let count = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&count);
        let handle = manager.subscribe(FramePhase::Begin, move |_| *counter.borrow_mut() += 1);

        step(&mut manager);
        assert!(manager.unsubscribe(&handle));
        step(&mut manager);
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn client_records_input_at_end_of_frame() {
        let (mut manager, server_end) = client();
        step(&mut manager);

        manager
            .input_source_mut()
            .record_input(move_atom(1.0), InputGroup::Move);
        step(&mut manager);

        let frame = manager
            .input_buffer()
            .read_data(CommandFrame::new(1))
            .expect("frame 1 recorded");
        assert_eq!(frame.atoms_for(OWNER), Some(&[move_atom(1.0)][..]));
        assert_eq!(manager.input_source().input_num(), 0);

        let packets = server_end.drain_inputs();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].client_command_frame, CommandFrame::new(1));
    }

    #[test]
    fn replay_simulates_each_frame_once() {
        let (mut manager, _server_end) = client();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        manager
            .player_input_stack_mut(OWNER)
            .controller_mut()
            .bind_action(MOVE, TriggerEvent::Triggered, move |atom| {
                sink.borrow_mut().push(atom.value.as_axis1d() as u32);
            });

        let begins = Rc::new(RefCell::new(Vec::new()));
        let begin_log = Rc::clone(&begins);
        manager.subscribe(FramePhase::Begin, move |tick| {
            if tick.is_rewinding() {
                begin_log.borrow_mut().push(tick.internal_frame.as_u32());
            }
        });

        for _ in 0..10 {
            let rcf = manager.real_command_frame().as_u32();
            if rcf > 0 {
                manager
                    .input_source_mut()
                    .record_input(move_atom(rcf as f32), InputGroup::Move);
            }
            step(&mut manager);
        }
        assert_eq!(manager.real_command_frame(), CommandFrame::new(10));
        // local bindings are not driven outside a replay
        assert!(seen.borrow().is_empty());

        manager.replay_frames(CommandFrame::new(5));

        assert_eq!(*seen.borrow(), vec![6, 7, 8, 9]);
        assert_eq!(*begins.borrow(), vec![6, 7, 8, 9]);
        assert_eq!(manager.internal_command_frame(), CommandFrame::new(10));
        assert_eq!(manager.real_command_frame(), CommandFrame::new(10));
        assert!(!manager.is_rewinding());
    }

    #[test]
    fn replay_runs_every_frame_through_the_present_exactly_once() {
        let (mut manager, _server_end) = client();
        let simulated = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&simulated);
        manager
            .player_input_stack_mut(OWNER)
            .controller_mut()
            .bind_action(MOVE, TriggerEvent::Triggered, move |atom| {
                sink.borrow_mut().push(atom.value.as_axis1d() as u32);
            });
        let begins = Rc::new(RefCell::new(Vec::new()));
        let begin_log = Rc::clone(&begins);
        manager.subscribe(FramePhase::Begin, move |tick| {
            begin_log.borrow_mut().push(tick.internal_frame.as_u32());
        });

        for _ in 0..10 {
            let rcf = manager.real_command_frame().as_u32();
            if rcf > 0 {
                manager
                    .input_source_mut()
                    .record_input(move_atom(rcf as f32), InputGroup::Move);
            }
            step(&mut manager);
        }
        assert_eq!(manager.real_command_frame(), CommandFrame::new(10));
        // the frame in progress already has buffered input
        assert!(manager
            .input_buffer
            .record_item_data(OWNER, &[move_atom(10.0)], CommandFrame::new(10)));
        begins.borrow_mut().clear();

        manager.replay_frames(CommandFrame::new(5));

        assert_eq!(*begins.borrow(), vec![6, 7, 8, 9, 10]);
        assert_eq!(*simulated.borrow(), vec![6, 7, 8, 9, 10]);
        assert_eq!(manager.internal_command_frame(), CommandFrame::new(10));
        assert_eq!(manager.real_command_frame(), CommandFrame::new(10));
    }

    #[test]
    fn replay_at_or_past_rcf_is_a_no_op() {
        let (mut manager, _server_end) = client();
        step(&mut manager);
        step(&mut manager);
        let dilation_before = manager.time_dilation().state();

        manager.replay_frames(CommandFrame::new(2));
        manager.replay_frames(CommandFrame::new(9));

        assert_eq!(manager.internal_command_frame(), CommandFrame::new(2));
        assert_eq!(manager.time_dilation().state(), dilation_before);
    }

    #[test]
    fn server_consumes_buffered_input_in_frame_order() {
        let mut server =
            CommandFrameManager::new(NetMode::DedicatedServer, CommandFrameConfig::default())
                .unwrap();
        let (_client_end, server_end) = LoopbackTransport::pair();
        server.post_login(OWNER, Box::new(server_end));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        server
            .player_input_stack_mut(OWNER)
            .controller_mut()
            .bind_action(MOVE, TriggerEvent::Triggered, move |atom| {
                sink.borrow_mut().push(atom.value.as_axis1d() as u32);
            });

        let mut client_ring: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(32);
        for frame in 1..=3u32 {
            assert!(client_ring.record_item_data(
                OWNER,
                &[move_atom(frame as f32)],
                CommandFrame::new(frame)
            ));
        }
        let packet =
            InputNetPacket::build_from_view(client_ring.read_range_data_shrink(CommandFrame::new(3), 16))
                .unwrap();
        server.server_receive_input(OWNER, &packet).unwrap();
        assert_eq!(server.buffered_frames(OWNER), 3);

        for _ in 0..3 {
            step(&mut server);
        }
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
        assert_eq!(server.buffered_frames(OWNER), 0);
        assert_eq!(server.input_buffer().head_frame(), CommandFrame::new(4));
    }

    #[test]
    fn server_without_input_keeps_head_at_rcf() {
        let mut server =
            CommandFrameManager::new(NetMode::DedicatedServer, CommandFrameConfig::default())
                .unwrap();
        for _ in 0..5 {
            step(&mut server);
        }
        assert_eq!(server.input_buffer().head_frame(), CommandFrame::new(6));
        assert!(server.input_buffer().is_empty());
    }

    #[test]
    fn unknown_channel_is_an_error() {
        let mut server =
            CommandFrameManager::new(NetMode::DedicatedServer, CommandFrameConfig::default())
                .unwrap();
        let packet = InputNetPacket {
            client_command_frame: CommandFrame::new(1),
            raw_data: Vec::new(),
        };
        let err = server.server_receive_input(OwnerId::new(9), &packet).unwrap_err();
        assert_eq!(
            err,
            CommandFrameError::UnknownChannel {
                owner: OwnerId::new(9)
            }
        );
    }

    #[test]
    fn reset_command_frame_snaps_all_counters() {
        let (mut manager, _server_end) = client();
        for _ in 0..3 {
            step(&mut manager);
        }
        assert!(manager.record_attribute_snapshot(CommandFrame::new(3), 42u32));

        manager.reset_command_frame(CommandFrame::new(20));

        assert_eq!(manager.real_command_frame(), CommandFrame::new(20));
        assert_eq!(manager.internal_command_frame(), CommandFrame::new(20));
        assert_eq!(manager.prev_command_frame(), CommandFrame::new(20));
        assert!(manager.input_buffer().is_empty());
        assert_eq!(manager.read_attribute_from_snapshot::<u32>(CommandFrame::new(3)), None);
        assert_eq!(manager.snapshot_buffer().count(), 0);
    }

    #[test]
    fn channel_listeners_fire_on_registration() {
        let mut server =
            CommandFrameManager::new(NetMode::DedicatedServer, CommandFrameConfig::default())
                .unwrap();
        let fired = Rc::new(RefCell::new(Vec::new()));

        let any = Rc::clone(&fired);
        let any_handle = server.bind_on_channel_registered(None, move |owner| {
            any.borrow_mut().push(("any", owner.as_u32()));
        });
        let only_two = Rc::clone(&fired);
        server.bind_on_channel_registered(Some(OwnerId::new(2)), move |owner| {
            only_two.borrow_mut().push(("two", owner.as_u32()));
        });

        server.post_login(OwnerId::new(1), Box::new(LoopbackTransport::default()));
        server.post_login(OwnerId::new(2), Box::new(LoopbackTransport::default()));
        assert_eq!(*fired.borrow(), vec![("any", 1), ("any", 2), ("two", 2)]);

        // binding late to an existing channel fires at once
        fired.borrow_mut().clear();
        let late = Rc::clone(&fired);
        server.bind_on_channel_registered(Some(OwnerId::new(1)), move |owner| {
            late.borrow_mut().push(("late", owner.as_u32()));
        });
        assert_eq!(*fired.borrow(), vec![("late", 1)]);

        fired.borrow_mut().clear();
        assert!(server.unbind_on_channel_registered(any_handle));
        server.post_login(OwnerId::new(3), Box::new(LoopbackTransport::default()));
        assert!(fired.borrow().is_empty());
    }

    #[test]
    fn post_login_repoints_existing_channel() {
        let mut server =
            CommandFrameManager::new(NetMode::DedicatedServer, CommandFrameConfig::default())
                .unwrap();
        let (old_client, old_server) = LoopbackTransport::pair();
        let (new_client, new_server) = LoopbackTransport::pair();
        server.post_login(OWNER, Box::new(old_server));
        server.post_login(OWNER, Box::new(new_server));
        assert_eq!(server.channel_count(), 1);

        step(&mut server);
        step(&mut server);
        assert_eq!(old_client.pending_deltas(), 0);
        assert_eq!(new_client.pending_deltas(), 1);
    }

    #[test]
    fn logout_removes_channel_and_local_owner() {
        let (mut manager, _server_end) = client();
        assert!(manager.logout(OWNER));
        assert!(manager.channel(OWNER).is_none());
        assert_eq!(manager.local_owner(), None);
        assert!(!manager.is_prepared());
        assert!(!manager.logout(OWNER));
    }

    #[test]
    fn shutdown_resets_everything() {
        let (mut manager, _server_end) = client();
        manager.subscribe(FramePhase::Begin, |_| {});
        for _ in 0..4 {
            step(&mut manager);
        }

        manager.shutdown();
        assert!(!manager.is_initialized());
        assert_eq!(manager.real_command_frame(), CommandFrame::ZERO);
        assert_eq!(manager.channel_count(), 0);
        assert!(manager.hooks().is_empty());
        assert!(manager.input_buffer().is_empty());

        manager.flush_command_frame(1.0);
        assert_eq!(manager.real_command_frame(), CommandFrame::ZERO);

        manager.initialize();
        let (client_end, _server_end) = LoopbackTransport::pair();
        manager.register_client_channel(OWNER, Box::new(client_end));
        step(&mut manager);
        step(&mut manager);
        assert!(manager.input_buffer().contains(CommandFrame::new(1)));
    }

    #[test]
    fn replicated_handles_resolve_to_actions() {
        let mut server =
            CommandFrameManager::new(NetMode::DedicatedServer, CommandFrameConfig::default())
                .unwrap();
        server.post_login(OWNER, Box::new(LoopbackTransport::default()));
        server.register_replicated_action(NetHandle::new(40), MOVE);

        let hits = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&hits);
        server
            .player_input_stack_mut(OWNER)
            .controller_mut()
            .bind_action(MOVE, TriggerEvent::Triggered, move |_| *counter.borrow_mut() += 1);

        let mut atom = move_atom(1.0);
        atom.action = ActionRef::Replicated(NetHandle::new(40));
        let mut unknown = move_atom(2.0);
        unknown.action = ActionRef::Replicated(NetHandle::new(41));

        let mut client_ring: OwnershipCircularQueue<InputFrame> = OwnershipCircularQueue::new(32);
        assert!(client_ring.record_item_data(OWNER, &[atom, unknown], CommandFrame::new(1)));
        let packet =
            InputNetPacket::build_from_view(client_ring.read_range_data_shrink(CommandFrame::new(1), 16))
                .unwrap();
        server.server_receive_input(OWNER, &packet).unwrap();

        step(&mut server);
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn invariants_hold_through_a_replay() {
        let (mut manager, _server_end) = client();
        for _ in 0..6 {
            step(&mut manager);
        }
        manager.replay_frames(CommandFrame::new(2));
        assert!(manager.check_invariants().is_ok());
    }
}
