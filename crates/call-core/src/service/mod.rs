//! Call service
//!
//! The single entry point the host wires everything into. Owns the
//! orchestration context, the shared call state, the 1:1 orchestrator,
//! and the group/call-link flows, and routes engine notifications to the
//! right place.

mod individual;
mod state;

pub use individual::IndividualCallService;
pub use state::{CallObserver, CallServiceDelegate, CallServiceState};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;

use crate::call::{Call, CallMode, GroupCall, IndividualCall, RingState};
use crate::config::CallConfig;
use crate::context::OrchestrationContext;
use crate::engine::{CallEngine, EngineEvent};
use crate::error::{defect, CallError, CallResult};
use crate::host::{
    CallHistorySink, CallPolicy, CallUiDelegate, RelayCredentialProvider, SystemCallReporter,
};
use crate::link::{
    AuthCredentialProvider, CallLinkAdminApi, CallLinkFetchJob, CallLinkRecord,
    CallLinkRecordStore, CallLinkState, CallLinkStateFetcher, CallLinkStateUpdater,
};
use crate::signaling::{SignalPayload, SignalingError, SignalingSender};
use crate::types::{
    CallId, CallMediaType, DataMode, DeviceId, GroupEndReason, GroupId, JoinState, RemoteUserId,
    RingCancelReason, RingId, RingUpdate, RoomId, SignalingUrgency,
};

/// Everything the host supplies when building a [`CallService`].
pub struct CallServiceDependencies {
    pub engine: Arc<dyn CallEngine>,
    pub transport: Arc<dyn SignalingSender>,
    pub system_reporter: Arc<dyn SystemCallReporter>,
    pub ui: Arc<dyn CallUiDelegate>,
    pub history: Arc<dyn CallHistorySink>,
    pub policy: Arc<dyn CallPolicy>,
    pub relay: Arc<dyn RelayCredentialProvider>,
    pub auth: Arc<dyn AuthCredentialProvider>,
    pub link_store: Arc<dyn CallLinkRecordStore>,
    pub link_fetcher: Arc<dyn CallLinkStateFetcher>,
    pub link_admin: Arc<dyn CallLinkAdminApi>,
}

/// How a call-link lobby obtains the link state it renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStateStrategy {
    /// Use the cached record state, fetching only if none is cached.
    ReuseCached,
    /// Always fetch fresh state before building the call.
    FetchFresh,
}

/// The call orchestration service.
pub struct CallService {
    ctx: OrchestrationContext,
    config: CallConfig,
    engine: Arc<dyn CallEngine>,
    state: Arc<CallServiceState>,
    individual: Arc<IndividualCallService>,
    transport: Arc<dyn SignalingSender>,
    reporter: Arc<dyn SystemCallReporter>,
    ui: Arc<dyn CallUiDelegate>,
    policy: Arc<dyn CallPolicy>,
    link_updater: Arc<CallLinkStateUpdater>,
    link_fetch_job: Arc<CallLinkFetchJob>,
    /// Ring the next incoming 1:1 call before setup finishes. Set by the
    /// notification extension handing over a call it already displayed.
    early_ring_next_incoming_call: AtomicBool,
    /// Recently cancelled ring ids, so a late ring request for one of
    /// them is discarded instead of re-ringing.
    cancelled_rings: DashMap<RingId, Instant>,
}

impl CallService {
    pub fn new(config: CallConfig, deps: CallServiceDependencies) -> Arc<Self> {
        let ctx = OrchestrationContext::new();
        let state = Arc::new(CallServiceState::new(&ctx, Arc::clone(&deps.system_reporter)));
        let individual = Arc::new(IndividualCallService::new(
            ctx.clone(),
            config.clone(),
            Arc::clone(&deps.engine),
            Arc::clone(&state),
            Arc::clone(&deps.transport),
            Arc::clone(&deps.system_reporter),
            Arc::clone(&deps.ui),
            Arc::clone(&deps.history),
            Arc::clone(&deps.policy),
            Arc::clone(&deps.relay),
        ));
        let link_updater = Arc::new(CallLinkStateUpdater::new(
            Arc::clone(&deps.link_store),
            Arc::clone(&deps.link_fetcher),
            Arc::clone(&deps.link_admin),
            Arc::clone(&deps.auth),
        ));
        let link_fetch_job = CallLinkFetchJob::new(
            Arc::clone(&link_updater),
            Arc::clone(&deps.link_store),
            config.link_fetch_backoff.clone(),
        );
        Arc::new(Self {
            ctx,
            config,
            engine: deps.engine,
            state,
            individual,
            transport: deps.transport,
            reporter: deps.system_reporter,
            ui: deps.ui,
            policy: deps.policy,
            link_updater,
            link_fetch_job,
            early_ring_next_incoming_call: AtomicBool::new(false),
            cancelled_rings: DashMap::new(),
        })
    }

    pub fn context(&self) -> &OrchestrationContext {
        &self.ctx
    }

    pub fn state(&self) -> &Arc<CallServiceState> {
        &self.state
    }

    pub fn individual_service(&self) -> &Arc<IndividualCallService> {
        &self.individual
    }

    pub fn link_updater(&self) -> &Arc<CallLinkStateUpdater> {
        &self.link_updater
    }

    /// The current call, if any.
    pub fn current_call(&self) -> Option<Arc<Call>> {
        self.state.current_call(&self.ctx)
    }

    /// Arrange for the next incoming 1:1 call to ring before its setup
    /// finishes. Consumed when that call becomes current.
    pub fn set_early_ring_next_incoming_call(&self) {
        self.early_ring_next_incoming_call.store(true, Ordering::SeqCst);
    }

    // MARK: 1:1 calls

    /// Place an outgoing 1:1 call. Fails if any call is already current.
    pub fn start_outgoing_individual_call(
        &self,
        remote: RemoteUserId,
        media_type: CallMediaType,
        local_device: DeviceId,
    ) -> CallResult<Arc<Call>> {
        if let Some(current) = self.current_call() {
            tracing::warn!(%current, "cannot place a call while another is current");
            return Err(CallError::assertion("another call is already current"));
        }
        let call = Call::new_individual(IndividualCall::outgoing(
            remote,
            media_type,
            local_device,
        ));
        self.state.add_call(&self.ctx, Arc::clone(&call));
        self.set_current(Some(Arc::clone(&call)));
        call.common().mark_pending_report_to_system();
        self.reporter.call_started(&call);
        self.ui.start_outgoing_call(&call);
        self.individual.handle_outgoing_call(&call);
        Ok(call)
    }

    /// A 1:1 offer arrived over signaling.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_received_offer(
        &self,
        caller: RemoteUserId,
        source_device: DeviceId,
        call_id: CallId,
        opaque: Bytes,
        message_age: std::time::Duration,
        media_type: CallMediaType,
        local_device: DeviceId,
    ) -> Arc<Call> {
        self.individual.handle_received_offer(
            caller,
            source_device,
            call_id,
            opaque,
            message_age,
            media_type,
            local_device,
        )
    }

    /// Accept the given incoming call.
    pub fn accept_call(&self, call: &Arc<Call>) {
        match call.mode() {
            CallMode::Individual(_) => self.individual.handle_accept_call(call),
            CallMode::GroupThread(_) | CallMode::CallLink(_) => {
                self.join_group_call_if_necessary(call);
            }
        }
    }

    /// Hang up or leave the given call.
    pub fn handle_local_hangup(&self, call: &Arc<Call>) {
        match call.mode() {
            CallMode::Individual(_) => self.individual.handle_local_hangup(call),
            CallMode::GroupThread(group) | CallMode::CallLink(group) => {
                // Declining an incoming ring cancels it for our other
                // devices too.
                if let RingState::IncomingRing { ring_id, .. } = group.ring_state() {
                    if let Some(group_id) = group.group_id() {
                        if let Err(error) = self.engine.cancel_group_ring(
                            group_id,
                            ring_id,
                            Some(RingCancelReason::DeclinedByUser),
                        ) {
                            tracing::warn!(%error, "failed to decline group ring");
                        }
                        self.note_cancelled_ring(ring_id);
                    }
                    group.set_ring_state(RingState::IncomingRingCancelled);
                }
                self.leave_and_terminate_group_call(call, group);
            }
        }
    }

    /// Mute or unmute the current call's microphone.
    pub fn set_local_audio_muted(&self, muted: bool) {
        let Some(call) = self.current_call() else {
            tracing::info!("mute change with no current call");
            return;
        };
        match call.mode() {
            CallMode::Individual(_) => self.individual.set_is_muted(&call, muted),
            CallMode::GroupThread(group) | CallMode::CallLink(group) => {
                group.handle().set_outgoing_audio_muted(muted);
                group.on_local_device_state_changed();
            }
        }
    }

    pub fn set_local_video_muted(&self, muted: bool) {
        let Some(call) = self.current_call() else {
            return;
        };
        match call.mode() {
            CallMode::Individual(individual) => individual.set_has_local_video(!muted),
            CallMode::GroupThread(group) | CallMode::CallLink(group) => {
                group.handle().set_outgoing_video_muted(muted);
                group.on_local_device_state_changed();
            }
        }
    }

    /// Re-apply the preferred bandwidth mode to the current call.
    pub fn configure_data_mode(&self) {
        let Some(call) = self.current_call() else {
            return;
        };
        let data_mode = if self.policy.prefer_low_data() {
            DataMode::Low
        } else {
            DataMode::Normal
        };
        match call.mode() {
            CallMode::Individual(_) => self.engine.update_data_mode(data_mode),
            CallMode::GroupThread(group) | CallMode::CallLink(group) => {
                group.handle().update_data_mode(data_mode);
            }
        }
    }

    // MARK: engine callbacks

    /// The engine registered a 1:1 call and assigned its id.
    pub fn on_should_start_call(
        &self,
        call: &Arc<Call>,
        call_id: CallId,
        is_outgoing: bool,
    ) {
        if !is_outgoing {
            if let Some(current) = self.current_call() {
                tracing::warn!(%current, %call, "incoming call while another is current");
                self.individual.handle_failed_call(
                    call,
                    CallError::obsolete("another call was already current"),
                    false,
                );
                return;
            }
            self.set_current(Some(Arc::clone(call)));
        }
        let ring_early = !is_outgoing
            && self
                .early_ring_next_incoming_call
                .swap(false, Ordering::SeqCst);
        self.individual
            .on_call_started_at_engine(call, call_id, is_outgoing, ring_early);
    }

    /// A 1:1 engine lifecycle event.
    pub fn on_engine_event(&self, call: &Arc<Call>, event: EngineEvent) {
        self.individual.on_engine_event(call, event);
    }

    // MARK: group calls

    /// Build a group-thread call and connect its media, making it
    /// current. Returns `None` when another call is current or the engine
    /// cannot build a session.
    pub fn build_and_connect_group_thread_call(
        &self,
        group_id: GroupId,
        ring_restricted: bool,
        video_muted: bool,
    ) -> Option<Arc<Call>> {
        if let Some(current) = self.current_call() {
            tracing::warn!(%current, "cannot build a group call while another is current");
            return None;
        }
        let session = self.engine.create_group_session(&group_id)?;
        let group = GroupCall::new_thread(
            session,
            group_id,
            ring_restricted,
            self.config.auto_mute_participant_threshold,
        );
        let call = Call::new_group_thread(group);
        self.finish_connecting_group_call(call, video_muted, false)
    }

    /// Build a call-link call and connect its media, making it current.
    ///
    /// Fetches or reuses the link state per `strategy`, refuses deleted
    /// links, and starts muted when the call is already crowded.
    pub async fn build_and_connect_call_link_call(
        &self,
        room_id: RoomId,
        strategy: LinkStateStrategy,
    ) -> CallResult<Arc<Call>> {
        if let Some(current) = self.current_call() {
            tracing::warn!(%current, "cannot build a call link call while another is current");
            return Err(CallError::assertion("another call is already current"));
        }
        let record = self.link_updater.store().get(&room_id);
        if record.as_ref().map(|r| r.is_deleted).unwrap_or(false) {
            return Err(CallError::LinkDeleted);
        }
        let cached_state = record.as_ref().and_then(|r| r.state.clone());
        let link_state = match (strategy, cached_state) {
            (LinkStateStrategy::ReuseCached, Some(state)) => state,
            _ => self.link_updater.read_call_link(&room_id).await?,
        };
        if link_state.revoked {
            return Err(CallError::LinkDeleted);
        }

        let auth = self
            .link_updater
            .auth_provider()
            .call_link_auth_credential()
            .await?;
        let admin_passkey = record.and_then(|r| r.admin_passkey);
        let session = self
            .engine
            .create_call_link_session(&room_id, auth.0, admin_passkey.clone())
            .ok_or_else(|| CallError::engine("could not create call link session"))?;
        let group = GroupCall::new_link(
            session,
            room_id,
            admin_passkey,
            link_state,
            self.config.auto_mute_participant_threshold,
        );
        let call = Call::new_call_link(group);
        self.finish_connecting_group_call(call, true, true)
            .ok_or_else(|| CallError::engine("call link media connect failed"))
    }

    fn finish_connecting_group_call(
        &self,
        call: Arc<Call>,
        video_muted: bool,
        apply_auto_mute: bool,
    ) -> Option<Arc<Call>> {
        let Some(group) = call.group() else {
            return None;
        };
        let audio_muted = apply_auto_mute && group.should_mute_automatically();
        group.handle().set_outgoing_audio_muted(audio_muted);
        group.handle().set_outgoing_video_muted(video_muted);

        self.state.add_call(&self.ctx, Arc::clone(&call));
        self.set_current(Some(Arc::clone(&call)));
        if !self.connect_group_call_if_needed(group) {
            tracing::error!(%call, "group media connect failed");
            self.state.terminate_call(&self.ctx, &call);
            return None;
        }
        Some(call)
    }

    /// Join the group call if not already joining or joined, reporting it
    /// to the telephony surface on first join.
    pub fn join_group_call_if_necessary(&self, call: &Arc<Call>) {
        let Some(group) = call.group() else {
            defect!(%call, "joining a 1:1 call as a group call");
            return;
        };
        if !self.state.is_current(&self.ctx, call) {
            defect!(%call, "joining a call that is not current");
            return;
        }
        if !self.connect_group_call_if_needed(group) {
            tracing::error!(%call, "group media connect failed");
            self.leave_and_terminate_group_call(call, group);
            return;
        }
        if group.join_state() == JoinState::NotJoined {
            group.handle().join();
        }
        if call.common().system_report_state()
            == crate::call::SystemReportState::NotReported
        {
            call.common().mark_pending_report_to_system();
            self.reporter.call_started(call);
            self.ui.start_outgoing_call(call);
        }
    }

    fn connect_group_call_if_needed(&self, group: &GroupCall) -> bool {
        if group.has_invoked_connect() {
            return true;
        }
        if group.handle().connect() {
            group.mark_connect_invoked();
            true
        } else {
            false
        }
    }

    /// Leave the group call. If media was ever connected the call object
    /// survives until the engine confirms the session ended; otherwise it
    /// is terminated immediately.
    pub fn leave_and_terminate_group_call(&self, call: &Arc<Call>, group: &GroupCall) {
        if group.has_invoked_connect() {
            group.set_should_terminate_on_end(true);
            group.handle().disconnect();
        } else {
            self.state.terminate_call(&self.ctx, call);
        }
    }

    /// Engine callback: local device state of the group session changed.
    pub fn on_group_local_device_state_changed(&self, call: &Arc<Call>) {
        let Some(group) = call.group() else {
            return;
        };
        group.on_local_device_state_changed();

        // An outgoing ring starts once we are joined, alone, and allowed
        // to ring.
        if group.join_state() == JoinState::Joined
            && group.ring_state() == RingState::ShouldRing
            && !group.is_ring_restricted()
            && group.handle().remote_device_count() == 0
        {
            group.set_ring_state(RingState::Ringing);
            group.handle().ring_all();
        }
    }

    /// Engine callback: remote device states of the group session changed.
    pub fn on_group_remote_device_states_changed(&self, call: &Arc<Call>) {
        let Some(group) = call.group() else {
            return;
        };
        // The wrapper concludes the ring (and notifies) before anyone
        // observes the remote-state change; a concluded ring means the
        // ring was answered.
        if group.on_remote_device_states_changed() {
            self.ui.recipient_accepted(call);
        }
    }

    /// Engine callback: a peek refreshed the group session.
    pub fn on_group_peek_changed(&self, call: &Arc<Call>) {
        let Some(group) = call.group() else {
            return;
        };
        group.on_peek_changed();
    }

    /// Engine callback: the group session ended.
    pub fn on_group_call_ended(&self, call: &Arc<Call>, reason: GroupEndReason) {
        let Some(group) = call.group() else {
            return;
        };
        if !reason.is_clean() {
            tracing::error!(%call, ?reason, "group call ended abnormally");
        }
        group.on_ended(&reason);
        if group.should_terminate_on_end() || !reason.is_clean() {
            self.state.terminate_call(&self.ctx, call);
        }
    }

    // MARK: group rings

    /// A ring update arrived for a group.
    pub fn did_receive_ring_update(
        &self,
        group_id: GroupId,
        ring_id: RingId,
        sender: RemoteUserId,
        update: RingUpdate,
    ) {
        self.purge_expired_cancelled_rings();

        if update != RingUpdate::Requested {
            self.handle_ring_concluded_remotely(&group_id, ring_id, update);
            return;
        }

        if self.is_ring_cancelled(ring_id)
            || !self.policy.group_ring_allowed(&group_id, &sender)
        {
            tracing::info!(%group_id, %ring_id, "discarding group ring");
            if let Err(error) = self.engine.cancel_group_ring(&group_id, ring_id, None) {
                tracing::warn!(%error, "failed to discard group ring");
            }
            return;
        }

        if let Some(current) = self.current_call() {
            let same_group = current
                .group()
                .and_then(|g| g.group_id())
                .map(|g| *g == group_id)
                .unwrap_or(false);
            if same_group {
                tracing::info!(%ring_id, "already in the ringing group's call");
                return;
            }
            tracing::info!(%current, %ring_id, "busy; declining group ring");
            if let Err(error) =
                self.engine
                    .cancel_group_ring(&group_id, ring_id, Some(RingCancelReason::Busy))
            {
                tracing::warn!(%error, "failed to send busy for group ring");
            }
            self.note_cancelled_ring(ring_id);
            return;
        }

        let Some(call) =
            self.build_and_connect_group_thread_call(group_id, false, true)
        else {
            tracing::error!(%ring_id, "could not build a call for the group ring");
            return;
        };
        if let Some(group) = call.group() {
            group.set_ring_state(RingState::IncomingRing {
                caller: sender,
                ring_id,
            });
        }
        call.common().mark_pending_report_to_system();
        self.reporter.call_started(&call);
        self.ui.report_incoming_call(&call);
    }

    fn handle_ring_concluded_remotely(
        &self,
        group_id: &GroupId,
        ring_id: RingId,
        update: RingUpdate,
    ) {
        self.note_cancelled_ring(ring_id);
        let Some(current) = self.current_call() else {
            return;
        };
        let Some(group) = current.group() else {
            return;
        };
        let matches_ring = group.group_id() == Some(group_id)
            && group.ring_state().incoming_ring_id() == Some(ring_id);
        if !matches_ring {
            return;
        }
        match update {
            RingUpdate::AcceptedOnAnotherDevice => self.ui.did_answer_elsewhere(&current),
            RingUpdate::DeclinedOnAnotherDevice => self.ui.did_decline_elsewhere(&current),
            RingUpdate::BusyLocally | RingUpdate::BusyOnAnotherDevice => {
                self.ui.was_busy_elsewhere(&current)
            }
            RingUpdate::ExpiredRing | RingUpdate::CancelledByRinger => {
                self.ui.remote_did_hangup(&current)
            }
            RingUpdate::Requested => unreachable!("handled by the caller"),
        }
        group.set_ring_state(RingState::IncomingRingCancelled);
        self.leave_and_terminate_group_call(&current, group);
    }

    fn note_cancelled_ring(&self, ring_id: RingId) {
        self.cancelled_rings.insert(ring_id, Instant::now());
    }

    fn is_ring_cancelled(&self, ring_id: RingId) -> bool {
        self.cancelled_rings.contains_key(&ring_id)
    }

    fn purge_expired_cancelled_rings(&self) {
        let expiry = self.config.cancelled_ring_expiry;
        self.cancelled_rings
            .retain(|_, cancelled_at| cancelled_at.elapsed() < expiry);
    }

    // MARK: opaque signaling

    /// The engine asked us to send an opaque call message to one user.
    pub fn on_should_send_call_message(
        self: &Arc<Self>,
        recipient: RemoteUserId,
        message: Bytes,
        urgency: SignalingUrgency,
    ) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let result = service
                .transport
                .send_call_message(
                    recipient,
                    None,
                    urgency,
                    SignalPayload::Opaque { data: message },
                )
                .await;
            if let Err(error) = result {
                service.handle_opaque_send_failure(&error);
                tracing::warn!(%recipient, %error, "opaque call message send failed");
            }
        });
    }

    /// The engine asked us to send an opaque update to a group.
    pub fn on_should_send_call_message_to_group(
        self: &Arc<Self>,
        group_id: GroupId,
        message: Bytes,
        urgency: SignalingUrgency,
        override_recipients: Vec<RemoteUserId>,
    ) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let result = service
                .transport
                .send_group_call_message(
                    group_id.clone(),
                    urgency,
                    message,
                    override_recipients,
                )
                .await;
            if let Err(error) = result {
                service.handle_opaque_send_failure(&error);
                tracing::warn!(%group_id, %error, "group call message send failed");
            }
        });
    }

    /// Identity failures on opaque sends surface on the current group
    /// call, which gates further sends on a user decision.
    fn handle_opaque_send_failure(&self, error: &SignalingError) {
        if !matches!(error, SignalingError::UntrustedIdentity) {
            return;
        }
        let Some(current) = self.current_call() else {
            return;
        };
        if let Some(group) = current.group() {
            group.on_untrusted_identity_error();
        }
    }

    // MARK: call links

    /// Fetch fresh state for a call link, serialized with other updates.
    pub async fn read_call_link(&self, room_id: &RoomId) -> CallResult<CallLinkState> {
        self.link_updater.read_call_link(room_id).await
    }

    pub async fn update_call_link_name(
        &self,
        room_id: &RoomId,
        name: String,
    ) -> CallResult<CallLinkState> {
        self.link_updater.update_name(room_id, name).await
    }

    pub async fn update_call_link_restrictions(
        &self,
        room_id: &RoomId,
        requires_admin_approval: bool,
    ) -> CallResult<CallLinkState> {
        self.link_updater
            .update_restrictions(room_id, requires_admin_approval)
            .await
    }

    pub async fn delete_call_link(&self, room_id: &RoomId) -> CallResult<()> {
        self.link_updater.delete_call_link(room_id).await
    }

    /// Note that a link's cached state may be stale (a sync message or
    /// push said so) and nudge the background fetch loop.
    pub fn flag_call_link_for_fetch(&self, room_id: &RoomId) {
        self.link_updater.store().mark_pending_fetch(room_id);
        self.link_fetch_job.signal_might_have_pending_fetch();
    }

    /// Start tracking a link the local user created.
    pub fn register_call_link(&self, room_id: RoomId, admin_passkey: Option<Bytes>) {
        self.link_updater
            .store()
            .upsert(CallLinkRecord::new(room_id.clone(), admin_passkey));
        self.flag_call_link_for_fetch(&room_id);
    }

    fn set_current(&self, call: Option<Arc<Call>>) {
        self.state.set_current_call(&self.ctx, call);
    }
}
