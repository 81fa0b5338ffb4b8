//! In-process workflow engine.
//!
//! Keeps each run's membership in memory, acknowledges synchronously
//! through the [`AckSender`], and records every call so tests can assert on
//! what the coordinator asked for. Failures can be injected per operation.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use encore_protocol::{DeviceId, RoomId, RunId, UserId};

use crate::{AckSender, CreateRun, EngineAck, EngineError, EngineGateway, JoinRun, RunRef};

/// One request the engine received, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Create(CreateRun),
    Join { run: RunRef, request: JoinRun },
    Leave { run: RunRef, user: UserId },
    Terminate { run: RunRef },
    ChangeEmittingDevice { run: RunRef, user: UserId, device: DeviceId },
    UpdatePositionConstraint { run: RunRef, user: UserId, fits: bool },
}

/// Operations a failure can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    Create,
    Join,
    Leave,
    Terminate,
    ChangeEmittingDevice,
    UpdatePositionConstraint,
}

#[derive(Default)]
struct State {
    runs: HashMap<RoomId, (RunId, HashSet<UserId>)>,
    calls: Vec<EngineCall>,
    failing: HashSet<EngineOp>,
    rejecting_joins: HashSet<UserId>,
}

/// An [`EngineGateway`] whose runs live in this process.
pub struct InMemoryEngine {
    state: Mutex<State>,
    acks: Option<AckSender>,
}

impl InMemoryEngine {
    /// An engine that pushes acknowledgements onto `acks`.
    pub fn new(acks: AckSender) -> Self {
        Self {
            state: Mutex::new(State::default()),
            acks: Some(acks),
        }
    }

    /// An engine that never acknowledges. Tests feed acks to the
    /// coordinator by hand.
    pub fn silent() -> Self {
        Self {
            state: Mutex::new(State::default()),
            acks: None,
        }
    }

    /// Makes every subsequent `op` fail with [`EngineError::Rejected`].
    pub fn fail(&self, op: EngineOp) {
        self.with_state(|s| {
            s.failing.insert(op);
        });
    }

    /// Clears an injected failure.
    pub fn recover(&self, op: EngineOp) {
        self.with_state(|s| {
            s.failing.remove(&op);
        });
    }

    /// Makes the engine refuse `user`'s joins.
    pub fn reject_joins_from(&self, user: UserId) {
        self.with_state(|s| {
            s.rejecting_joins.insert(user);
        });
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.with_state(|s| s.calls.clone())
    }

    /// Whether a run for `room` is alive.
    pub fn has_run(&self, room: RoomId) -> bool {
        self.with_state(|s| s.runs.contains_key(&room))
    }

    /// Users the engine considers members of `room`'s run.
    pub fn run_members(&self, room: RoomId) -> Vec<UserId> {
        self.with_state(|s| {
            let mut members: Vec<UserId> = s
                .runs
                .get(&room)
                .map(|(_, m)| m.iter().copied().collect())
                .unwrap_or_default();
            members.sort();
            members
        })
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        // A poisoned lock only means a test thread panicked mid-call; the
        // recorded state is still usable.
        let mut guard = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    /// Records `call` and fails if `op` has an injected failure.
    fn record(&self, op: EngineOp, call: EngineCall) -> Result<(), EngineError> {
        self.with_state(|s| {
            s.calls.push(call);
            if s.failing.contains(&op) {
                Err(EngineError::Rejected {
                    status: 503,
                    message: format!("{op:?} unavailable"),
                })
            } else {
                Ok(())
            }
        })
    }

    fn ack(&self, ack: EngineAck) {
        if let Some(acks) = &self.acks {
            if acks.send(ack).is_err() {
                tracing::warn!("engine ack receiver dropped");
            }
        }
    }

    fn check_run(state: &State, run: RunRef) -> Result<(), EngineError> {
        match state.runs.get(&run.workflow_id) {
            Some((run_id, _)) if *run_id == run.run_id => Ok(()),
            _ => Err(EngineError::UnknownRun(format!(
                "{}/{}",
                run.workflow_id, run.run_id
            ))),
        }
    }
}

impl std::fmt::Debug for InMemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEngine").finish_non_exhaustive()
    }
}

#[async_trait]
impl EngineGateway for InMemoryEngine {
    async fn create(&self, request: CreateRun) -> Result<RunId, EngineError> {
        let room_id = request.room_id;
        let creator = request.creator_user_id;
        self.record(EngineOp::Create, EngineCall::Create(request))?;

        let run_id = RunId::new();
        self.with_state(|s| {
            s.runs
                .insert(room_id, (run_id, HashSet::from([creator])))
        });
        self.ack(EngineAck::Created { room_id });
        Ok(run_id)
    }

    async fn join(&self, run: RunRef, request: JoinRun) -> Result<(), EngineError> {
        self.record(EngineOp::Join, EngineCall::Join { run, request })?;

        let outcome = self.with_state(|s| {
            Self::check_run(s, run)?;
            if s.rejecting_joins.contains(&request.user_id) {
                return Ok(None);
            }
            let members = s
                .runs
                .get_mut(&run.workflow_id)
                .map(|(_, m)| {
                    m.insert(request.user_id);
                    m.len()
                })
                .unwrap_or_default();
            Ok::<_, EngineError>(Some(members))
        })?;

        match outcome {
            Some(users_length) => {
                self.ack(EngineAck::Joined {
                    room_id: run.workflow_id,
                    user_id: request.user_id,
                    device_id: request.device_id,
                });
                self.ack(EngineAck::UsersLengthUpdated {
                    room_id: run.workflow_id,
                    users_length: u32::try_from(users_length).unwrap_or(u32::MAX),
                });
            }
            None => self.ack(EngineAck::JoinRejected {
                room_id: run.workflow_id,
                user_id: request.user_id,
                reason: "rejected by engine".to_string(),
            }),
        }
        Ok(())
    }

    async fn leave(&self, run: RunRef, user: UserId) -> Result<(), EngineError> {
        self.record(EngineOp::Leave, EngineCall::Leave { run, user })?;

        let users_length = self.with_state(|s| {
            Self::check_run(s, run)?;
            Ok::<_, EngineError>(
                s.runs
                    .get_mut(&run.workflow_id)
                    .map(|(_, m)| {
                        m.remove(&user);
                        m.len()
                    })
                    .unwrap_or_default(),
            )
        })?;

        self.ack(EngineAck::UsersLengthUpdated {
            room_id: run.workflow_id,
            users_length: u32::try_from(users_length).unwrap_or(u32::MAX),
        });
        Ok(())
    }

    async fn terminate(&self, run: RunRef) -> Result<(), EngineError> {
        self.record(EngineOp::Terminate, EngineCall::Terminate { run })?;
        self.with_state(|s| {
            Self::check_run(s, run)?;
            s.runs.remove(&run.workflow_id);
            Ok::<(), EngineError>(())
        })
    }

    async fn change_emitting_device(
        &self,
        run: RunRef,
        user: UserId,
        device: DeviceId,
    ) -> Result<(), EngineError> {
        self.record(
            EngineOp::ChangeEmittingDevice,
            EngineCall::ChangeEmittingDevice { run, user, device },
        )?;
        self.with_state(|s| Self::check_run(s, run))
    }

    async fn update_position_constraint(
        &self,
        run: RunRef,
        user: UserId,
        fits: bool,
    ) -> Result<(), EngineError> {
        self.record(
            EngineOp::UpdatePositionConstraint,
            EngineCall::UpdatePositionConstraint { run, user, fits },
        )?;
        self.with_state(|s| Self::check_run(s, run))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_protocol::PlayingMode;

    fn create_request(room_id: RoomId, creator: UserId) -> CreateRun {
        CreateRun {
            room_id,
            name: "room".into(),
            creator_user_id: creator,
            creator_device_id: DeviceId::new(),
            initial_track_ids: vec![],
            playing_mode: PlayingMode::Broadcast,
            is_open: true,
            is_open_only_invited_users_can_vote: false,
            minimum_score_to_be_played: 1,
            position_constraint: None,
            creator_fits_position_constraint: None,
        }
    }

    #[tokio::test]
    async fn test_create_then_join_acknowledges() {
        let (tx, mut rx) = crate::ack_channel();
        let engine = InMemoryEngine::new(tx);
        let room = RoomId::new();
        let creator = UserId::new();
        let guest = UserId::new();

        let run_id = engine.create(create_request(room, creator)).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), EngineAck::Created { room_id: room });

        let device = DeviceId::new();
        engine
            .join(
                RunRef::new(room, run_id),
                JoinRun {
                    user_id: guest,
                    device_id: device,
                    user_has_been_invited: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            EngineAck::Joined {
                room_id: room,
                user_id: guest,
                device_id: device
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            EngineAck::UsersLengthUpdated {
                room_id: room,
                users_length: 2
            }
        );
    }

    #[tokio::test]
    async fn test_rejected_join_acknowledges_rejection() {
        let (tx, mut rx) = crate::ack_channel();
        let engine = InMemoryEngine::new(tx);
        let room = RoomId::new();
        let guest = UserId::new();
        let run_id = engine.create(create_request(room, UserId::new())).await.unwrap();
        let _ = rx.try_recv();

        engine.reject_joins_from(guest);
        engine
            .join(
                RunRef::new(room, run_id),
                JoinRun {
                    user_id: guest,
                    device_id: DeviceId::new(),
                    user_has_been_invited: false,
                },
            )
            .await
            .unwrap();

        assert!(matches!(rx.try_recv().unwrap(), EngineAck::JoinRejected { .. }));
        assert_eq!(engine.run_members(room).len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_is_recorded_and_returned() {
        let engine = InMemoryEngine::silent();
        engine.fail(EngineOp::Create);

        let room = RoomId::new();
        let err = engine
            .create(create_request(room, UserId::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Rejected { status: 503, .. }));
        assert!(!engine.has_run(room));
        assert_eq!(engine.calls().len(), 1);

        engine.recover(EngineOp::Create);
        assert!(engine.create(create_request(room, UserId::new())).await.is_ok());
    }

    #[tokio::test]
    async fn test_terminate_unknown_run_fails() {
        let engine = InMemoryEngine::silent();
        let err = engine
            .terminate(RunRef::new(RoomId::new(), RunId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownRun(_)));
    }
}
