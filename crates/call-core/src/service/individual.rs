//! 1:1 call orchestration
//!
//! Drives direct calls end to end: placing and accepting, the engine
//! event stream, signaling dispatch, and the single failure funnel every
//! non-viable call goes through. Every current-call-sensitive engine
//! event is guarded against stale calls first; a stale call is failed
//! with an obsolete-call error without ever touching the live call.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::call::{Call, IndividualCall, IndividualCallState};
use crate::config::CallConfig;
use crate::context::OrchestrationContext;
use crate::engine::{CallEngine, EngineEvent};
use crate::error::{defect, CallError};
use crate::host::{
    CallHistorySink, CallOutcome, CallPolicy, CallUiDelegate, RelayCredentialProvider,
    SystemCallReporter,
};
use crate::service::state::CallServiceState;
use crate::signaling::{SignalPayload, SignalingError, SignalingSender};
use crate::types::{
    CallDirection, CallId, CallMediaType, DataMode, DeviceId, HangupType, SignalingUrgency,
};

pub struct IndividualCallService {
    ctx: OrchestrationContext,
    config: CallConfig,
    engine: Arc<dyn CallEngine>,
    state: Arc<CallServiceState>,
    transport: Arc<dyn SignalingSender>,
    reporter: Arc<dyn SystemCallReporter>,
    ui: Arc<dyn CallUiDelegate>,
    history: Arc<dyn CallHistorySink>,
    policy: Arc<dyn CallPolicy>,
    relay: Arc<dyn RelayCredentialProvider>,
}

impl IndividualCallService {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: OrchestrationContext,
        config: CallConfig,
        engine: Arc<dyn CallEngine>,
        state: Arc<CallServiceState>,
        transport: Arc<dyn SignalingSender>,
        reporter: Arc<dyn SystemCallReporter>,
        ui: Arc<dyn CallUiDelegate>,
        history: Arc<dyn CallHistorySink>,
        policy: Arc<dyn CallPolicy>,
        relay: Arc<dyn RelayCredentialProvider>,
    ) -> Self {
        Self {
            ctx,
            config,
            engine,
            state,
            transport,
            reporter,
            ui,
            history,
            policy,
            relay,
        }
    }

    // MARK: user actions

    /// Kick off an outgoing call that has already been made current.
    pub fn handle_outgoing_call(&self, call: &Arc<Call>) {
        let Some(individual) = call.individual() else {
            defect!(%call, "outgoing 1:1 flow started for a group call");
            return;
        };
        if !self.state.is_current(&self.ctx, call) {
            defect!(%call, "outgoing call is not the current call");
            return;
        }
        self.record_outcome(call, individual, CallOutcome::OutgoingIncomplete);
        if let Err(error) = self.engine.place_call(
            call,
            individual.media_type(),
            individual.local_device(),
        ) {
            self.handle_failed_call(call, error, true);
        }
    }

    /// The user accepted an incoming call.
    ///
    /// If the engine has not declared the call ringable yet, the accept is
    /// parked in the `Accepting` state and resolved automatically when
    /// the ringing notification arrives.
    pub fn handle_accept_call(&self, call: &Arc<Call>) {
        let Some(individual) = call.individual() else {
            defect!(%call, "accept on a group call routed to the 1:1 service");
            return;
        };
        if !self.state.is_current(&self.ctx, call) {
            defect!(%call, "accepting a call that is not current");
            return;
        }
        if individual.state() == IndividualCallState::LocalRingingAnticipatory {
            tracing::info!(%call, "deferring accept until the engine is ready");
            individual.set_state(IndividualCallState::Accepting);
            return;
        }
        let Some(call_id) = individual.call_id() else {
            self.handle_failed_call(
                call,
                CallError::assertion("accepting a call with no engine call id"),
                true,
            );
            return;
        };
        self.record_outcome(call, individual, CallOutcome::IncomingIncomplete);
        if let Err(error) = self.engine.accept(call_id) {
            self.handle_failed_call(call, error, true);
        }
    }

    /// The user hung up. The state transition lands when the engine
    /// reports the ended event.
    pub fn handle_local_hangup(&self, call: &Arc<Call>) {
        if !self.state.is_current(&self.ctx, call) {
            tracing::info!(%call, "ignoring hangup for a non-current call");
            return;
        }
        if let Some(individual) = call.individual() {
            individual.clear_offer_deadline();
        }
        if let Err(error) = self.engine.hangup() {
            self.handle_failed_call(call, error, true);
        }
    }

    pub fn set_is_muted(&self, call: &Arc<Call>, muted: bool) {
        let Some(individual) = call.individual() else {
            return;
        };
        individual.set_is_muted(muted);
        self.ensure_audio_state(call, individual);
    }

    pub fn set_is_on_hold(&self, call: &Arc<Call>, on_hold: bool) {
        let Some(individual) = call.individual() else {
            return;
        };
        individual.set_is_on_hold(on_hold);
        self.ensure_audio_state(call, individual);
    }

    /// Audio flows only while the call is connected and neither muted nor
    /// held.
    fn ensure_audio_state(&self, _call: &Arc<Call>, individual: &IndividualCall) {
        let enabled = individual.state() == IndividualCallState::Connected
            && !individual.is_muted()
            && !individual.is_on_hold();
        self.engine.set_local_audio_enabled(enabled);
    }

    // MARK: call setup

    /// The engine registered the call and assigned its id. Hands the call
    /// its id, optionally rings early, and continues setup once relay
    /// servers arrive.
    pub fn on_call_started_at_engine(
        self: &Arc<Self>,
        call: &Arc<Call>,
        call_id: CallId,
        is_outgoing: bool,
        ring_early: bool,
    ) {
        let Some(individual) = call.individual() else {
            defect!(%call, "engine started a 1:1 call for a group call object");
            return;
        };
        if is_outgoing {
            individual.set_outgoing_call_id(call_id);
        } else if ring_early {
            // Present the incoming call before setup finishes so the user
            // sees it as soon as possible.
            self.handle_ringing(call, true);
        }
        self.proceed_once_relays_arrive(call, call_id);
    }

    fn proceed_once_relays_arrive(self: &Arc<Self>, call: &Arc<Call>, call_id: CallId) {
        let service = Arc::clone(self);
        let call = Arc::clone(call);
        tokio::spawn(async move {
            let servers = match service.relay.relay_servers().await {
                Ok(servers) => servers,
                Err(error) => {
                    service.fail_setup(&call, call_id, error);
                    return;
                }
            };
            if !service.state.is_current(&service.ctx, &call) {
                tracing::info!(%call, "call ended while fetching relay servers");
                return;
            }
            let remote = match call.individual() {
                Some(individual) => individual.remote(),
                None => return,
            };
            let recognized = service.policy.is_recognized_peer(&remote);
            if !recognized {
                tracing::info!(%call, "unrecognized peer; relay-only routing");
            }
            let hide_ip = !recognized || service.policy.hide_ip_for_all_calls();
            let data_mode = service.preferred_data_mode();
            if let Err(error) = service.engine.proceed(call_id, servers, hide_ip, data_mode) {
                service.fail_setup(&call, call_id, error);
            }
        });
    }

    fn fail_setup(&self, call: &Arc<Call>, call_id: CallId, error: CallError) {
        if !self.state.is_current(&self.ctx, call) {
            tracing::info!(%call, %error, "setup failed after the call already ended");
            return;
        }
        self.engine.drop_call(call_id);
        self.handle_failed_call(call, error, false);
    }

    fn preferred_data_mode(&self) -> DataMode {
        if self.policy.prefer_low_data() {
            DataMode::Low
        } else {
            DataMode::Normal
        }
    }

    // MARK: inbound signaling

    /// A call offer arrived. Builds and tracks the incoming call, arms the
    /// grace timer, and forwards the offer to the engine. The caller (the
    /// call service) decides whether the call becomes current.
    #[allow(clippy::too_many_arguments)]
    pub fn handle_received_offer(
        self: &Arc<Self>,
        caller: crate::types::RemoteUserId,
        source_device: DeviceId,
        call_id: CallId,
        opaque: Bytes,
        message_age: Duration,
        media_type: CallMediaType,
        local_device: DeviceId,
    ) -> Arc<Call> {
        let call = Call::new_individual(IndividualCall::incoming(
            caller,
            call_id,
            media_type,
            local_device,
        ));
        tracing::info!(%call, %call_id, ?message_age, "received call offer");
        self.state.add_call(&self.ctx, Arc::clone(&call));
        self.arm_offer_deadline(&call);
        if let Err(error) = self.engine.received_offer(
            &call,
            call_id,
            source_device,
            opaque,
            message_age,
            media_type,
            local_device,
        ) {
            self.handle_failed_call(&call, error, true);
        }
        call
    }

    /// Fail the call if it never connects within the grace period. Covers
    /// offers whose engine session silently stalls.
    fn arm_offer_deadline(self: &Arc<Self>, call: &Arc<Call>) {
        let service = Arc::clone(self);
        let deadline_call = Arc::clone(call);
        let grace = self.config.incoming_offer_grace_period;
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(individual) = deadline_call.individual() else {
                return;
            };
            if individual.is_ended() || deadline_call.common().connected_at().is_some() {
                return;
            }
            tracing::warn!(%deadline_call, "incoming offer never connected");
            service.handle_failed_call(
                &deadline_call,
                CallError::timeout("incoming call did not connect in time"),
                true,
            );
        });
        if let Some(individual) = call.individual() {
            individual.set_offer_deadline(task.abort_handle());
        }
    }

    pub fn handle_received_answer(
        &self,
        call_id: CallId,
        source_device: DeviceId,
        opaque: Bytes,
    ) {
        let Some(call) = self.find_call(call_id) else {
            tracing::info!(%call_id, "answer for an unknown call");
            return;
        };
        if let Err(error) = self
            .engine
            .received_answer(&call, call_id, source_device, opaque)
        {
            self.handle_failed_call(&call, error, true);
        }
    }

    pub fn handle_received_ice_candidates(
        &self,
        call_id: CallId,
        source_device: DeviceId,
        candidates: Vec<Bytes>,
    ) {
        let Some(call) = self.find_call(call_id) else {
            tracing::info!(%call_id, "ICE candidates for an unknown call");
            return;
        };
        if let Err(error) =
            self.engine
                .received_ice_candidates(&call, call_id, source_device, candidates)
        {
            self.handle_failed_call(&call, error, true);
        }
    }

    pub fn handle_received_hangup(
        &self,
        call_id: CallId,
        source_device: DeviceId,
        hangup_type: HangupType,
        sender_device: DeviceId,
    ) {
        let Some(call) = self.find_call(call_id) else {
            tracing::info!(%call_id, "hangup for an unknown call");
            return;
        };
        if let Err(error) = self.engine.received_hangup(
            &call,
            call_id,
            source_device,
            hangup_type,
            sender_device,
        ) {
            self.handle_failed_call(&call, error, true);
        }
    }

    pub fn handle_received_busy(&self, call_id: CallId, source_device: DeviceId) {
        let Some(call) = self.find_call(call_id) else {
            tracing::info!(%call_id, "busy for an unknown call");
            return;
        };
        if let Err(error) = self.engine.received_busy(&call, call_id, source_device) {
            self.handle_failed_call(&call, error, true);
        }
    }

    fn find_call(&self, call_id: CallId) -> Option<Arc<Call>> {
        self.state
            .active_or_pending_calls()
            .into_iter()
            .find(|call| {
                call.individual()
                    .and_then(|individual| individual.call_id())
                    == Some(call_id)
            })
    }

    // MARK: outbound signaling

    pub fn on_should_send_offer(
        self: &Arc<Self>,
        call: &Arc<Call>,
        call_id: CallId,
        destination_device: Option<DeviceId>,
        opaque: Bytes,
        media_type: CallMediaType,
    ) {
        self.send_signal(
            call,
            destination_device,
            SignalingUrgency::HandleImmediately,
            SignalPayload::Offer {
                call_id,
                media_type,
                opaque,
            },
        );
    }

    pub fn on_should_send_answer(
        self: &Arc<Self>,
        call: &Arc<Call>,
        call_id: CallId,
        destination_device: Option<DeviceId>,
        opaque: Bytes,
    ) {
        self.send_signal(
            call,
            destination_device,
            SignalingUrgency::HandleImmediately,
            SignalPayload::Answer { call_id, opaque },
        );
    }

    pub fn on_should_send_ice_updates(
        self: &Arc<Self>,
        call: &Arc<Call>,
        call_id: CallId,
        destination_device: Option<DeviceId>,
        candidates: Vec<Bytes>,
    ) {
        self.send_signal(
            call,
            destination_device,
            SignalingUrgency::Droppable,
            SignalPayload::IceUpdates { call_id, candidates },
        );
    }

    pub fn on_should_send_hangup(
        self: &Arc<Self>,
        call: &Arc<Call>,
        call_id: CallId,
        destination_device: Option<DeviceId>,
        hangup_type: HangupType,
        sender_device: DeviceId,
    ) {
        self.send_signal(
            call,
            destination_device,
            SignalingUrgency::HandleImmediately,
            SignalPayload::Hangup {
                call_id,
                hangup_type,
                sender_device,
            },
        );
    }

    pub fn on_should_send_busy(
        self: &Arc<Self>,
        call: &Arc<Call>,
        call_id: CallId,
        destination_device: Option<DeviceId>,
    ) {
        self.send_signal(
            call,
            destination_device,
            SignalingUrgency::HandleImmediately,
            SignalPayload::Busy { call_id },
        );
    }

    /// Dispatch one call message and report the outcome to the engine.
    ///
    /// ICE update failures are only logged: the candidates are droppable
    /// and the engine will fail the call itself if connectivity never
    /// comes up. All other failures are reported so the engine can end
    /// the call.
    fn send_signal(
        self: &Arc<Self>,
        call: &Arc<Call>,
        destination_device: Option<DeviceId>,
        urgency: SignalingUrgency,
        payload: SignalPayload,
    ) {
        let service = Arc::clone(self);
        let call = Arc::clone(call);
        tokio::spawn(async move {
            let Some(individual) = call.individual() else {
                return;
            };
            let remote = individual.remote();
            let is_ice = matches!(payload, SignalPayload::IceUpdates { .. });
            let call_id = payload.call_id();
            match service
                .transport
                .send_call_message(remote, destination_device, urgency, payload)
                .await
            {
                Ok(()) => {
                    if let Some(call_id) = call_id {
                        if let Err(error) = service.engine.signaling_message_did_send(call_id) {
                            tracing::warn!(%call_id, %error, "engine rejected send receipt");
                        }
                    }
                }
                Err(error) => {
                    if is_ice {
                        tracing::warn!(%call, %error, "dropping failed ICE update send");
                        return;
                    }
                    if matches!(error, SignalingError::UntrustedIdentity) {
                        // TODO: raise a safety-number change prompt for 1:1
                        // calls; group calls already surface this through
                        // the untrusted-identity observer.
                        tracing::warn!(%remote, "identity changed while sending call message");
                    }
                    tracing::warn!(%call, %error, "call message send failed");
                    if let Some(call_id) = call_id {
                        service.engine.signaling_message_did_fail(call_id);
                    }
                }
            }
        });
    }

    // MARK: engine events

    /// Route one engine lifecycle event for a 1:1 call.
    pub fn on_engine_event(self: &Arc<Self>, call: &Arc<Call>, event: EngineEvent) {
        let Some(individual) = call.individual() else {
            defect!(%call, ?event, "1:1 engine event for a group call");
            return;
        };
        tracing::info!(%call, ?event, state = ?individual.state(), "engine event");
        match event {
            EngineEvent::RingingLocal | EngineEvent::RingingRemote => {
                self.handle_ringing(call, false);
            }
            EngineEvent::ConnectedLocal => {
                // Local accept was handled when the user accepted.
                self.handle_connected(call);
            }
            EngineEvent::ConnectedRemote => {
                if !self.ensure_current(call) {
                    // The recipient still accepted, even if the call is no
                    // longer presentable.
                    self.ui.recipient_accepted(call);
                    return;
                }
                self.handle_connected(call);
                self.ui.recipient_accepted(call);
            }
            EngineEvent::EndedLocalHangup => {
                if !self.ensure_current(call) {
                    return;
                }
                match individual.outcome() {
                    Some(CallOutcome::OutgoingIncomplete) => {
                        self.record_outcome(call, individual, CallOutcome::OutgoingMissed);
                    }
                    Some(CallOutcome::IncomingIncomplete) | None
                        if individual.state().is_pre_connected()
                            && individual.direction() == CallDirection::Incoming =>
                    {
                        self.record_outcome(call, individual, CallOutcome::IncomingDeclined);
                    }
                    _ => {}
                }
                individual.set_state(IndividualCallState::LocalHangup);
                self.ensure_audio_state(call, individual);
                self.state.terminate_call(&self.ctx, call);
            }
            EngineEvent::EndedRemoteHangup => {
                if !self.ensure_current(call) {
                    return;
                }
                if individual.state().is_pre_connected()
                    && individual.direction() == CallDirection::Incoming
                {
                    self.handle_missed_call(call, individual, CallOutcome::IncomingMissed);
                }
                individual.set_state(IndividualCallState::RemoteHangup);
                self.ui.remote_did_hangup(call);
                self.state.terminate_call(&self.ctx, call);
            }
            EngineEvent::EndedRemoteHangupNeedPermission => {
                if !self.ensure_current(call) {
                    return;
                }
                if individual.direction() == CallDirection::Incoming {
                    self.handle_missed_call(
                        call,
                        individual,
                        CallOutcome::IncomingMissedBecausePermission,
                    );
                }
                individual.set_state(IndividualCallState::RemoteHangupNeedPermission);
                self.ui.remote_did_hangup(call);
                self.state.terminate_call(&self.ctx, call);
            }
            EngineEvent::EndedRemoteHangupAccepted => {
                self.handle_ended_elsewhere(
                    call,
                    individual,
                    IndividualCallState::AnsweredElsewhere,
                    CallOutcome::IncomingAnsweredElsewhere,
                );
            }
            EngineEvent::EndedRemoteHangupDeclined => {
                self.handle_ended_elsewhere(
                    call,
                    individual,
                    IndividualCallState::DeclinedElsewhere,
                    CallOutcome::IncomingDeclinedElsewhere,
                );
            }
            EngineEvent::EndedRemoteHangupBusy => {
                self.handle_ended_elsewhere(
                    call,
                    individual,
                    IndividualCallState::BusyElsewhere,
                    CallOutcome::IncomingBusyElsewhere,
                );
            }
            EngineEvent::EndedRemoteBusy => {
                if !self.ensure_current(call) {
                    return;
                }
                if individual.direction() != CallDirection::Outgoing {
                    defect!(%call, "busy signal for an incoming call");
                }
                self.record_outcome(call, individual, CallOutcome::OutgoingMissed);
                individual.set_state(IndividualCallState::RemoteBusy);
                self.ui.remote_busy(call);
                self.state.terminate_call(&self.ctx, call);
            }
            EngineEvent::EndedRemoteGlare | EngineEvent::EndedRemoteReCall => {
                if !self.ensure_current(call) {
                    return;
                }
                if individual.outcome() == Some(CallOutcome::OutgoingIncomplete) {
                    self.record_outcome(call, individual, CallOutcome::OutgoingMissed);
                }
                individual.set_state(IndividualCallState::LocalHangup);
                self.state.terminate_call(&self.ctx, call);
            }
            EngineEvent::EndedTimeout => {
                self.handle_failed_call(call, CallError::timeout("call setup"), false);
            }
            EngineEvent::EndedSignalingFailure | EngineEvent::EndedGlareHandlingFailure => {
                self.handle_failed_call(call, CallError::Signaling, false);
            }
            EngineEvent::EndedInternalFailure => {
                self.handle_failed_call(
                    call,
                    CallError::assertion("engine reported an internal failure"),
                    true,
                );
            }
            EngineEvent::EndedConnectionFailure => {
                self.handle_failed_call(call, CallError::Disconnected, false);
            }
            EngineEvent::EndedDropped => {
                tracing::debug!(%call, "engine confirmed the drop");
            }
            EngineEvent::RemoteAudioEnable => {
                if self.ensure_current(call) {
                    individual.set_is_remote_audio_muted(false);
                }
            }
            EngineEvent::RemoteAudioDisable => {
                if self.ensure_current(call) {
                    individual.set_is_remote_audio_muted(true);
                }
            }
            EngineEvent::RemoteVideoEnable => {
                if self.ensure_current(call) {
                    individual.set_is_remote_video_enabled(true);
                }
            }
            EngineEvent::RemoteVideoDisable => {
                if self.ensure_current(call) {
                    individual.set_is_remote_video_enabled(false);
                }
            }
            EngineEvent::RemoteSharingScreenEnable => {
                if self.ensure_current(call) {
                    individual.set_is_remote_sharing_screen(true);
                }
            }
            EngineEvent::RemoteSharingScreenDisable => {
                if self.ensure_current(call) {
                    individual.set_is_remote_sharing_screen(false);
                }
            }
            EngineEvent::Reconnecting => {
                if self.ensure_current(call) {
                    individual.set_state(IndividualCallState::Reconnecting);
                    self.ensure_audio_state(call, individual);
                }
            }
            EngineEvent::Reconnected => {
                if !self.ensure_current(call) {
                    return;
                }
                if individual.state() == IndividualCallState::Reconnecting {
                    individual.set_state(IndividualCallState::Connected);
                    self.ensure_audio_state(call, individual);
                } else {
                    defect!(%call, state = ?individual.state(), "reconnected without reconnecting");
                }
            }
            EngineEvent::ReceivedOfferExpired => {
                self.handle_missed_call(call, individual, CallOutcome::IncomingMissed);
                individual.set_state(IndividualCallState::LocalFailure);
                self.state.terminate_call(&self.ctx, call);
            }
            EngineEvent::ReceivedOfferWhileActive | EngineEvent::ReceivedOfferWithGlare => {
                self.handle_missed_call(call, individual, CallOutcome::IncomingMissed);
                individual.set_state(IndividualCallState::LocalFailure);
                self.state.terminate_call(&self.ctx, call);
            }
        }
    }

    fn handle_ended_elsewhere(
        &self,
        call: &Arc<Call>,
        individual: &IndividualCall,
        end_state: IndividualCallState,
        outcome: CallOutcome,
    ) {
        if !self.ensure_current(call) {
            return;
        }
        match individual.state() {
            IndividualCallState::Answering
            | IndividualCallState::LocalRingingAnticipatory
            | IndividualCallState::LocalRingingReadyToAnswer
            | IndividualCallState::Accepting
            | IndividualCallState::Connected
            | IndividualCallState::Reconnecting => {
                self.record_outcome(call, individual, outcome);
                individual.set_state(end_state);
                match end_state {
                    IndividualCallState::AnsweredElsewhere => self.ui.did_answer_elsewhere(call),
                    IndividualCallState::DeclinedElsewhere => self.ui.did_decline_elsewhere(call),
                    IndividualCallState::BusyElsewhere => self.ui.was_busy_elsewhere(call),
                    _ => {}
                }
                self.state.terminate_call(&self.ctx, call);
            }
            IndividualCallState::Idle
            | IndividualCallState::Dialing
            | IndividualCallState::RemoteRinging => {
                self.handle_failed_call(
                    call,
                    CallError::assertion("handled-elsewhere hangup for an outgoing call"),
                    false,
                );
            }
            state if state.is_terminal() => {
                tracing::debug!(%call, ?state, "already ended; ignoring elsewhere hangup");
            }
            state => {
                defect!(%call, ?state, "unexpected state for an elsewhere hangup");
            }
        }
    }

    /// The engine declared the call ringable. `anticipatory` marks the
    /// early ring placed before setup finished.
    pub fn handle_ringing(&self, call: &Arc<Call>, anticipatory: bool) {
        let Some(individual) = call.individual() else {
            return;
        };
        if !self.ensure_current(call) {
            return;
        }
        match individual.state() {
            IndividualCallState::Dialing => {
                individual.set_state(IndividualCallState::RemoteRinging);
            }
            IndividualCallState::Answering => {
                if anticipatory {
                    individual.set_state(IndividualCallState::LocalRingingAnticipatory);
                } else {
                    individual.set_state(IndividualCallState::LocalRingingReadyToAnswer);
                    self.present_incoming_call(call);
                }
            }
            IndividualCallState::LocalRingingAnticipatory => {
                if anticipatory {
                    defect!(%call, "double anticipatory ring");
                    return;
                }
                individual.set_state(IndividualCallState::LocalRingingReadyToAnswer);
                self.present_incoming_call(call);
            }
            IndividualCallState::Accepting => {
                // The user accepted during the anticipatory ring; the
                // engine is ready now.
                self.handle_accept_call(call);
            }
            IndividualCallState::RemoteRinging => {
                tracing::debug!(%call, "already ringing");
            }
            state => {
                defect!(%call, ?state, "ringing notification in an unexpected state");
            }
        }
    }

    fn present_incoming_call(&self, call: &Arc<Call>) {
        call.common().mark_pending_report_to_system();
        self.reporter.call_started(call);
        self.ui.report_incoming_call(call);
    }

    fn handle_connected(&self, call: &Arc<Call>) {
        let Some(individual) = call.individual() else {
            return;
        };
        if !self.ensure_current(call) {
            return;
        }
        individual.clear_offer_deadline();
        call.common().set_connected_if_needed();
        individual.set_state(IndividualCallState::Connected);
        let outcome = match individual.direction() {
            CallDirection::Outgoing => CallOutcome::Outgoing,
            CallDirection::Incoming => CallOutcome::Incoming,
        };
        self.record_outcome(call, individual, outcome);
        self.ensure_audio_state(call, individual);
        self.engine.update_data_mode(self.preferred_data_mode());
    }

    /// Stale-call guard. Every current-call-sensitive event goes through
    /// here first: if the event's call is no longer current, it is failed
    /// on its own, the live call untouched.
    fn ensure_current(&self, call: &Arc<Call>) -> bool {
        if self.state.is_current(&self.ctx, call) {
            return true;
        }
        self.clean_up_stale_call(call);
        false
    }

    fn clean_up_stale_call(&self, stale: &Arc<Call>) {
        if self.state.current_call(&self.ctx).is_some() {
            tracing::warn!(%stale, "failing a stale call");
            self.handle_failed_call(
                stale,
                CallError::obsolete("event arrived for a superseded call"),
                false,
            );
        } else {
            tracing::info!(%stale, "event for a call that already ended");
        }
    }

    /// The single funnel every non-viable call goes through.
    ///
    /// Classifies an unanswered incoming call as missed, moves the call to
    /// `LocalFailure`, notifies, quiesces the engine, and terminates.
    pub fn handle_failed_call(&self, failed: &Arc<Call>, error: CallError, reset_engine: bool) {
        let Some(individual) = failed.individual() else {
            defect!(%failed, %error, "group call routed to the 1:1 failure funnel");
            self.state.terminate_call(&self.ctx, failed);
            return;
        };
        tracing::error!(%failed, %error, reset_engine, "call failed");

        if individual.direction() == CallDirection::Incoming
            && individual.state().is_pre_connected()
        {
            let outcome = if matches!(error, CallError::MicrophonePermissionDenied) {
                CallOutcome::IncomingMissedBecausePermission
            } else {
                CallOutcome::IncomingMissed
            };
            self.handle_missed_call(failed, individual, outcome);
        }

        if individual.is_ended() {
            tracing::debug!(%failed, "call already ended; skipping failure transition");
        } else {
            if error.should_silently_drop_call() {
                if let Some(call_id) = individual.call_id() {
                    self.engine.drop_call(call_id);
                }
            } else if reset_engine {
                self.engine.reset();
            }
            self.ui.fail_call(failed, &error);
            individual.set_error(error);
            individual.set_state(IndividualCallState::LocalFailure);
        }

        self.state.terminate_call(&self.ctx, failed);
    }

    fn handle_missed_call(
        &self,
        call: &Arc<Call>,
        individual: &IndividualCall,
        outcome: CallOutcome,
    ) {
        let previous = self.record_outcome(call, individual, outcome);
        let was_unresolved = matches!(
            previous,
            None | Some(CallOutcome::IncomingIncomplete)
        );
        if outcome.counts_as_missed() && was_unresolved {
            self.ui.report_missed_call(call, outcome);
        }
    }

    fn record_outcome(
        &self,
        call: &Arc<Call>,
        individual: &IndividualCall,
        outcome: CallOutcome,
    ) -> Option<CallOutcome> {
        let previous = individual.set_outcome(outcome);
        if previous != Some(outcome) {
            self.history.record_outcome(call, outcome);
        }
        previous
    }
}
