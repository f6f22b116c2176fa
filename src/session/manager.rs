use alloc::{boxed::Box, sync::Arc, vec::Vec};

use super::{
    BackendContext, ControllerId, Coordinator, SessionController, SessionNtf, SessionState,
    SessionTable, SessionType,
};
use crate::{
    block::Block,
    message::{MessageReader, MessageWriter},
    packet::{gid, MessageId},
    uci::{DeviceState, Error, HandlerFn, HandlerToken, MessageHandlers, Uci, UciCore},
    Status,
};

/// Opcodes of the session configuration group
pub mod session_config_oid {
    pub const INIT: u8 = 0x00;
    pub const DEINIT: u8 = 0x01;
    pub const STATUS_NTF: u8 = 0x02;
    pub const SET_APP_CONFIG: u8 = 0x03;
    pub const GET_APP_CONFIG: u8 = 0x04;
    pub const GET_COUNT: u8 = 0x05;
    pub const GET_STATE: u8 = 0x06;
}

/// Opcodes of the session control group
pub mod session_control_oid {
    pub const START: u8 = 0x00;
    pub const STOP: u8 = 0x01;
    pub const GET_RANGING_COUNT: u8 = 0x03;
}

struct Registered {
    id: ControllerId,
    types: Vec<SessionType>,
    ops: Box<dyn SessionController>,
}

enum Target {
    Type(SessionType),
    Owner(ControllerId),
}

/// A failed command: the status and what follows it in the response
struct Rejection {
    status: Status,
    body: MessageWriter,
}

impl From<Status> for Rejection {
    fn from(status: Status) -> Self {
        Rejection {
            status,
            body: MessageWriter::new(),
        }
    }
}

type Reply = Result<MessageWriter, Rejection>;

fn syntax<T>(result: Result<T, Error>) -> Result<T, Status> {
    result.map_err(|_| Status::SYNTAX_ERROR)
}

/// Routes session commands to the controller owning each session type
#[derive(Default)]
pub struct BackendManager {
    controllers: Vec<Registered>,
    default: Option<Registered>,
    sessions: SessionTable,
    coordinator: Option<Box<dyn Coordinator>>,
    pending: Vec<SessionNtf>,
    next_id: u32,
}

impl BackendManager {
    pub fn new() -> Self {
        BackendManager::default()
    }

    fn next_id(&mut self) -> ControllerId {
        let id = ControllerId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    /// Registers a controller for the one or two session types it declares
    ///
    /// A type already served by another controller makes the registration
    /// fail with `Busy`.
    pub fn register(
        &mut self,
        controller: Box<dyn SessionController>,
    ) -> Result<ControllerId, Error> {
        let types = controller.session_types().to_vec();
        if types.is_empty() || types.len() > 2 {
            warn!(
                "a controller serves one or two session types, not {}",
                types.len()
            );
            return Err(Error::InvalidArgument);
        }
        let taken = self
            .controllers
            .iter()
            .any(|c| c.types.iter().any(|t| types.contains(t)));
        if taken {
            warn!("session type already served");
            return Err(Error::Busy);
        }

        let id = self.next_id();
        self.controllers.push(Registered {
            id,
            types,
            ops: controller,
        });
        info!("session controller {} registered", id.0);
        Ok(id)
    }

    /// Registers the controller serving every type no other controller
    /// declares, replacing the previous one
    ///
    /// The replacement is refused with `Busy` while the previous default
    /// still owns sessions. Its sessions would be left with a controller that
    /// knows nothing of them, so they must be deinitialized first. Once the
    /// previous default owns nothing it is dropped and replaced.
    pub fn register_default(
        &mut self,
        controller: Box<dyn SessionController>,
    ) -> Result<ControllerId, Error> {
        if let Some(previous) = &self.default {
            if self.owns_sessions(previous.id) {
                warn!("default controller still owns sessions");
                return Err(Error::Busy);
            }
        }
        let id = self.next_id();
        self.default = Some(Registered {
            id,
            types: Vec::new(),
            ops: controller,
        });
        info!("default session controller {} registered", id.0);
        Ok(id)
    }

    /// Removes a controller, which must not own sessions anymore
    pub fn unregister(&mut self, id: ControllerId) -> Result<Box<dyn SessionController>, Error> {
        if self.owns_sessions(id) {
            return Err(Error::Busy);
        }
        if self.default.as_ref().map(|d| d.id) == Some(id) {
            return self
                .default
                .take()
                .map(|d| d.ops)
                .ok_or(Error::InvalidArgument);
        }
        let index = self
            .controllers
            .iter()
            .position(|c| c.id == id)
            .ok_or(Error::InvalidArgument)?;
        Ok(self.controllers.remove(index).ops)
    }

    /// Installs the region coordinator handed to controllers
    pub fn set_coordinator(&mut self, coordinator: Option<Box<dyn Coordinator>>) {
        self.coordinator = coordinator;
    }

    /// Number of sessions of the given type, or of any type with `None`
    pub fn session_count(&self, stype: Option<SessionType>) -> usize {
        self.sessions.count(stype)
    }

    /// Sessions tracked by the manager
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    fn owns_sessions(&self, id: ControllerId) -> bool {
        self.sessions.iter().any(|s| s.owner() == id)
    }

    /// Runs `f` on the controller selected by `target`, `None` if there is
    /// none
    fn with_controller<R>(
        &mut self,
        core: &mut UciCore,
        target: Target,
        f: impl FnOnce(&mut dyn SessionController, &mut BackendContext<'_>) -> R,
    ) -> Option<R> {
        let BackendManager {
            controllers,
            default,
            sessions,
            coordinator,
            pending,
            ..
        } = self;

        let entry = match target {
            Target::Type(stype) => controllers
                .iter_mut()
                .find(|c| c.types.contains(&stype))
                .or(default.as_mut()),
            Target::Owner(id) => controllers
                .iter_mut()
                .find(|c| c.id == id)
                .or(default.as_mut().filter(|d| d.id == id)),
        }?;

        let mut ctx = BackendContext {
            core,
            sessions,
            coordinator: coordinator.as_deref_mut(),
            controller: entry.id,
            pending,
        };
        Some(f(&mut *entry.ops, &mut ctx))
    }

    /// Runs `f` on the controller owning session `handle`
    fn with_owner<R>(
        &mut self,
        core: &mut UciCore,
        handle: u32,
        f: impl FnOnce(&mut dyn SessionController, &mut BackendContext<'_>) -> Result<R, Status>,
    ) -> Result<R, Status> {
        let owner = self
            .sessions
            .find(handle)
            .ok_or(Status::ERROR_SESSION_NOT_EXIST)?
            .owner();
        self.with_controller(core, Target::Owner(owner), f)
            .unwrap_or(Err(Status::FAILED))
    }

    /// Runs backend work outside of a command, such as a session ending
    /// after its last ranging round
    ///
    /// `f` acts for the controller owning session `handle`. The session
    /// notifications it queues are sent on return, then the device state is
    /// updated.
    pub fn with_session<R>(
        &mut self,
        core: &mut UciCore,
        handle: u32,
        f: impl FnOnce(&mut BackendContext<'_>) -> Result<R, Status>,
    ) -> Result<R, Status> {
        let result = self.with_owner(core, handle, |_, ctx| f(ctx));
        self.flush_notifications(core);
        self.update_device_state(core);
        result
    }

    /// Serves one command of the session configuration or control group
    fn handle_command(
        &mut self,
        core: &mut UciCore,
        id: MessageId,
        payload: Option<Block>,
    ) -> Result<(), Error> {
        use session_config_oid as config;
        use session_control_oid as control;

        let mut reader = MessageReader::new(payload.as_ref());
        let reply = match (id.gid(), id.oid()) {
            (gid::SESSION_CONFIG, config::INIT) => self.session_init(core, &mut reader),
            (gid::SESSION_CONFIG, config::DEINIT) => self.session_deinit(core, &mut reader),
            (gid::SESSION_CONFIG, config::SET_APP_CONFIG) => {
                self.set_app_config(core, &mut reader)
            }
            (gid::SESSION_CONFIG, config::GET_APP_CONFIG) => {
                self.get_app_config(core, &mut reader)
            }
            (gid::SESSION_CONFIG, config::GET_COUNT) => self.get_count(),
            (gid::SESSION_CONFIG, config::GET_STATE) => self.get_state(core, &mut reader),
            (gid::SESSION_CONTROL, control::START) => self.start(core, &mut reader),
            (gid::SESSION_CONTROL, control::STOP) => self.stop(core, &mut reader),
            (gid::SESSION_CONTROL, control::GET_RANGING_COUNT) => {
                self.get_ranging_count(core, &mut reader)
            }
            _ => return Err(Status::UNKNOWN_OID.into()),
        };
        self.respond(core, id, reply)
    }

    /// Sends the response, the pending session notifications, then any
    /// device state change
    fn respond(&mut self, core: &mut UciCore, id: MessageId, reply: Reply) -> Result<(), Error> {
        let (status, body) = match reply {
            Ok(body) => (Status::OK, body),
            Err(Rejection { status, body }) => (status, body),
        };
        let sent = if body.is_empty() {
            core.send_status(id, status)
        } else {
            let mut payload = MessageWriter::new();
            payload.put_u8(status as u8).put_slice(body.as_slice());
            core.send_bytes(id.to_response(), payload.as_slice())
        };

        self.flush_notifications(core);
        self.update_device_state(core);
        sent
    }

    fn flush_notifications(&mut self, core: &mut UciCore) {
        let id = MessageId::notification(gid::SESSION_CONFIG, session_config_oid::STATUS_NTF);
        for ntf in self.pending.drain(..) {
            let mut payload = MessageWriter::new();
            payload
                .put_u32_le(ntf.handle)
                .put_u8(ntf.state as u8)
                .put_u8(ntf.reason);
            if let Err(error) = core.send_bytes(id, payload.as_slice()) {
                warn!("session {} notification lost: {:?}", ntf.handle, error);
            }
        }
    }

    /// Moves the device between `Ready` and `Active` following sessions
    fn update_device_state(&mut self, core: &mut UciCore) {
        if core.device_state() == DeviceState::Error {
            return;
        }
        let BackendManager {
            controllers,
            default,
            sessions,
            ..
        } = self;

        let mut active = false;
        for session in sessions.iter() {
            let owner = controllers
                .iter_mut()
                .find(|c| c.id == session.owner())
                .or(default.as_mut().filter(|d| d.id == session.owner()));
            if let Some(owner) = owner {
                if owner.ops.get_current_state(session) == SessionState::Active {
                    active = true;
                    break;
                }
            }
        }

        let state = if active {
            DeviceState::Active
        } else {
            DeviceState::Ready
        };
        if let Err(error) = core.set_device_state_notification(state) {
            warn!("device state notification lost: {:?}", error);
        }
    }

    fn session_init(&mut self, core: &mut UciCore, payload: &mut MessageReader<'_>) -> Reply {
        let handle = syntax(payload.read_u32_le())?;
        let stype = SessionType::from_u8(syntax(payload.read_u8())?);
        if self.sessions.find(handle).is_some() {
            return Err(Status::ERROR_SESSION_DUPLICATE.into());
        }

        self.with_controller(core, Target::Type(stype), |ops, ctx| {
            ops.init(ctx, handle, stype)
        })
        .unwrap_or_else(|| {
            warn!("no controller for session type {}", stype.to_u8());
            Err(Status::REJECTED)
        })?;

        let mut body = MessageWriter::new();
        body.put_u32_le(handle);
        Ok(body)
    }

    fn session_deinit(&mut self, core: &mut UciCore, payload: &mut MessageReader<'_>) -> Reply {
        let handle = syntax(payload.read_u32_le())?;
        self.with_owner(core, handle, |ops, ctx| ops.deinit(ctx, handle))?;
        Ok(MessageWriter::new())
    }

    fn set_app_config(&mut self, core: &mut UciCore, payload: &mut MessageReader<'_>) -> Reply {
        let handle = syntax(payload.read_u32_le())?;
        let count = syntax(payload.read_u8())?;

        let mut body = MessageWriter::new();
        let result = self.with_owner(core, handle, |ops, ctx| {
            ops.set_app_config(ctx, handle, count, payload, &mut body)
        });
        if body.is_empty() {
            body.put_u8(0);
        }
        match result {
            Ok(()) => Ok(body),
            Err(status) => Err(Rejection { status, body }),
        }
    }

    fn get_app_config(&mut self, core: &mut UciCore, payload: &mut MessageReader<'_>) -> Reply {
        let handle = syntax(payload.read_u32_le())?;
        let count = syntax(payload.read_u8())?;
        let ids = syntax(payload.read_bytes(count as usize))?;

        let mut body = MessageWriter::new();
        let result = self.with_owner(core, handle, |ops, ctx| {
            ops.get_app_config(ctx, handle, &ids, &mut body)
        });
        if body.is_empty() {
            body.put_u8(0);
        }
        match result {
            Ok(()) => Ok(body),
            Err(status) => Err(Rejection { status, body }),
        }
    }

    fn get_count(&mut self) -> Reply {
        let count = self.sessions.count(None).min(u8::MAX as usize);
        let mut body = MessageWriter::new();
        body.put_u8(count as u8);
        Ok(body)
    }

    fn get_state(&mut self, core: &mut UciCore, payload: &mut MessageReader<'_>) -> Reply {
        let handle = syntax(payload.read_u32_le())?;
        let state = self.with_owner(core, handle, |ops, ctx| ops.get_state(ctx, handle))?;
        let mut body = MessageWriter::new();
        body.put_u8(state as u8);
        Ok(body)
    }

    fn start(&mut self, core: &mut UciCore, payload: &mut MessageReader<'_>) -> Reply {
        let handle = syntax(payload.read_u32_le())?;
        self.with_owner(core, handle, |ops, ctx| ops.start(ctx, handle))?;
        Ok(MessageWriter::new())
    }

    fn stop(&mut self, core: &mut UciCore, payload: &mut MessageReader<'_>) -> Reply {
        let handle = syntax(payload.read_u32_le())?;
        self.with_owner(core, handle, |ops, ctx| ops.stop(ctx, handle))?;
        Ok(MessageWriter::new())
    }

    fn get_ranging_count(&mut self, core: &mut UciCore, payload: &mut MessageReader<'_>) -> Reply {
        let handle = syntax(payload.read_u32_le())?;
        let count = self.with_owner(core, handle, |ops, ctx| {
            ops.get_ranging_count(ctx, handle)
        })?;
        let mut body = MessageWriter::new();
        body.put_u32_le(count);
        Ok(body)
    }
}

/// Shared handle on a [`BackendManager`], registered as the session groups'
/// message handlers
#[derive(Clone, Default)]
pub struct BackendManagerHandle(Arc<spin::Mutex<BackendManager>>);

impl BackendManagerHandle {
    pub fn new(manager: BackendManager) -> Self {
        BackendManagerHandle(Arc::new(spin::Mutex::new(manager)))
    }

    /// Locks the manager, to register controllers or inspect sessions
    ///
    /// Must not be held while the UCI context dispatches a message.
    pub fn lock(&self) -> spin::MutexGuard<'_, BackendManager> {
        self.0.lock()
    }

    /// Registers the session configuration and session control handlers
    pub fn register_handlers(&self, uci: &mut Uci) -> Result<[HandlerToken; 2], Error> {
        use session_config_oid as config;
        use session_control_oid as control;

        let serve = session_command as HandlerFn<Self>;
        let config_handlers = MessageHandlers::new(
            &[
                (MessageId::command(gid::SESSION_CONFIG, config::INIT), serve),
                (MessageId::command(gid::SESSION_CONFIG, config::DEINIT), serve),
                (MessageId::command(gid::SESSION_CONFIG, config::SET_APP_CONFIG), serve),
                (MessageId::command(gid::SESSION_CONFIG, config::GET_APP_CONFIG), serve),
                (MessageId::command(gid::SESSION_CONFIG, config::GET_COUNT), serve),
                (MessageId::command(gid::SESSION_CONFIG, config::GET_STATE), serve),
            ],
            self.clone(),
        );
        let control_handlers = MessageHandlers::new(
            &[
                (MessageId::command(gid::SESSION_CONTROL, control::START), serve),
                (MessageId::command(gid::SESSION_CONTROL, control::STOP), serve),
                (MessageId::command(gid::SESSION_CONTROL, control::GET_RANGING_COUNT), serve),
            ],
            self.clone(),
        );

        let first = uci.register_handlers(config_handlers)?;
        match uci.register_handlers(control_handlers) {
            Ok(second) => Ok([first, second]),
            Err(error) => {
                if let Err(rollback) = uci.unregister_handlers(first) {
                    warn!("could not roll back session config handlers: {:?}", rollback);
                }
                Err(error)
            }
        }
    }
}

fn session_command(
    core: &mut UciCore,
    manager: &mut BackendManagerHandle,
    id: MessageId,
    payload: Option<Block>,
) -> Result<(), Error> {
    manager.0.lock().handle_command(core, id, payload)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        block::HeapAllocator,
        session::{reason, RegionTable, Session},
        UciConfig,
    };

    struct FakeSession {
        state: SessionState,
        configs: Vec<(u8, Vec<u8>)>,
        rounds: u32,
    }

    struct Fake {
        types: &'static [SessionType],
    }

    impl Fake {
        fn boxed(types: &'static [SessionType]) -> Box<dyn SessionController> {
            Box::new(Fake { types })
        }
    }

    fn fake<'a>(
        ctx: &'a mut BackendContext<'_>,
        handle: u32,
    ) -> Result<&'a mut FakeSession, Status> {
        ctx.session(handle)?
            .data_mut::<FakeSession>()
            .ok_or(Status::FAILED)
    }

    impl SessionController for Fake {
        fn session_types(&self) -> &[SessionType] {
            self.types
        }

        fn init(
            &mut self,
            ctx: &mut BackendContext<'_>,
            handle: u32,
            stype: SessionType,
        ) -> Result<(), Status> {
            let session = FakeSession {
                state: SessionState::Init,
                configs: Vec::new(),
                rounds: 0,
            };
            ctx.session_add(handle, stype, Box::new(session))?;
            ctx.send_session_ntf(
                handle,
                SessionState::Init,
                reason::STATE_CHANGE_WITH_SESSION_MANAGEMENT_COMMANDS,
            );
            Ok(())
        }

        fn deinit(&mut self, ctx: &mut BackendContext<'_>, handle: u32) -> Result<(), Status> {
            ctx.session_remove(handle)?;
            ctx.send_session_ntf(
                handle,
                SessionState::Deinit,
                reason::STATE_CHANGE_WITH_SESSION_MANAGEMENT_COMMANDS,
            );
            Ok(())
        }

        fn start(&mut self, ctx: &mut BackendContext<'_>, handle: u32) -> Result<(), Status> {
            if fake(ctx, handle)?.state != SessionState::Idle {
                return Err(Status::ERROR_SESSION_NOT_CONFIGURED);
            }
            ctx.request_region("fira").map_err(|_| Status::REJECTED)?;
            let session = fake(ctx, handle)?;
            session.state = SessionState::Active;
            session.rounds += 3;
            ctx.send_session_ntf(
                handle,
                SessionState::Active,
                reason::STATE_CHANGE_WITH_SESSION_MANAGEMENT_COMMANDS,
            );
            Ok(())
        }

        fn stop(&mut self, ctx: &mut BackendContext<'_>, handle: u32) -> Result<(), Status> {
            if fake(ctx, handle)?.state != SessionState::Active {
                return Err(Status::REJECTED);
            }
            fake(ctx, handle)?.state = SessionState::Idle;
            let _ = ctx.release_region("fira");
            ctx.send_session_ntf(
                handle,
                SessionState::Idle,
                reason::STATE_CHANGE_WITH_SESSION_MANAGEMENT_COMMANDS,
            );
            Ok(())
        }

        fn set_app_config(
            &mut self,
            ctx: &mut BackendContext<'_>,
            handle: u32,
            count: u8,
            tlvs: &mut MessageReader<'_>,
            out: &mut MessageWriter,
        ) -> Result<(), Status> {
            let session = fake(ctx, handle)?;
            let mut rejected = Vec::new();
            for _ in 0..count {
                let id = tlvs.read_u8().map_err(|_| Status::SYNTAX_ERROR)?;
                let len = tlvs.read_u8().map_err(|_| Status::SYNTAX_ERROR)?;
                let value = tlvs.read_bytes(len as usize).map_err(|_| Status::SYNTAX_ERROR)?;
                if id == 0xFF {
                    rejected.push(id);
                } else {
                    session.configs.push((id, value));
                }
            }
            if !rejected.is_empty() {
                out.put_u8(rejected.len() as u8);
                for id in rejected {
                    out.put_u8(id).put_u8(Status::INVALID_PARAM as u8);
                }
                return Err(Status::INVALID_PARAM);
            }
            session.state = SessionState::Idle;
            Ok(())
        }

        fn get_app_config(
            &mut self,
            ctx: &mut BackendContext<'_>,
            handle: u32,
            ids: &[u8],
            out: &mut MessageWriter,
        ) -> Result<(), Status> {
            let session = fake(ctx, handle)?;
            let found: Vec<&(u8, Vec<u8>)> = session
                .configs
                .iter()
                .filter(|(id, _)| ids.is_empty() || ids.contains(id))
                .collect();
            out.put_u8(found.len() as u8);
            for (id, value) in found {
                out.put_u8(*id).put_u8(value.len() as u8).put_slice(value);
            }
            Ok(())
        }

        fn get_state(
            &mut self,
            ctx: &mut BackendContext<'_>,
            handle: u32,
        ) -> Result<SessionState, Status> {
            Ok(fake(ctx, handle)?.state)
        }

        fn get_current_state(&mut self, session: &Session) -> SessionState {
            session
                .data::<FakeSession>()
                .map_or(SessionState::Deinit, |s| s.state)
        }

        fn get_ranging_count(
            &mut self,
            ctx: &mut BackendContext<'_>,
            handle: u32,
        ) -> Result<u32, Status> {
            Ok(fake(ctx, handle)?.rounds)
        }
    }

    /// Controller implementing only the mandatory operations
    struct Minimal;

    impl SessionController for Minimal {
        fn session_types(&self) -> &[SessionType] {
            &[]
        }

        fn init(
            &mut self,
            ctx: &mut BackendContext<'_>,
            handle: u32,
            stype: SessionType,
        ) -> Result<(), Status> {
            ctx.session_add(handle, stype, Box::new(()))
        }

        fn deinit(&mut self, ctx: &mut BackendContext<'_>, handle: u32) -> Result<(), Status> {
            ctx.session_remove(handle)
        }

        fn set_app_config(
            &mut self,
            _: &mut BackendContext<'_>,
            _: u32,
            _: u8,
            _: &mut MessageReader<'_>,
            _: &mut MessageWriter,
        ) -> Result<(), Status> {
            Ok(())
        }

        fn get_app_config(
            &mut self,
            _: &mut BackendContext<'_>,
            _: u32,
            _: &[u8],
            _: &mut MessageWriter,
        ) -> Result<(), Status> {
            Ok(())
        }

        fn get_state(
            &mut self,
            _: &mut BackendContext<'_>,
            _: u32,
        ) -> Result<SessionState, Status> {
            Ok(SessionState::Init)
        }

        fn get_current_state(&mut self, _: &Session) -> SessionState {
            SessionState::Init
        }

        fn get_ranging_count(&mut self, _: &mut BackendContext<'_>, _: u32) -> Result<u32, Status> {
            Ok(0)
        }
    }

    fn setup() -> (Uci, BackendManagerHandle) {
        let mut uci = Uci::new(UciConfig::default(), HeapAllocator::new()).unwrap();
        let manager = BackendManagerHandle::default();
        manager
            .lock()
            .register(Fake::boxed(&[SessionType::Ranging, SessionType::DataTransfer]))
            .unwrap();
        manager.register_handlers(&mut uci).unwrap();
        (uci, manager)
    }

    fn command(uci: &mut Uci, gid: u8, oid: u8, payload: &[u8]) {
        let mut packet = alloc::vec![0x20 | gid, oid, 0x00, payload.len() as u8];
        packet.extend_from_slice(payload);
        uci.packet_recv_bytes(&packet).unwrap();
    }

    fn drain(uci: &mut Uci) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(packet) = uci.packet_send_get_ready() {
            out.push(packet.to_vec());
            uci.packet_send_done(packet, Ok(()));
        }
        out
    }

    const HANDLE: [u8; 4] = [0x78, 0x56, 0x34, 0x12];

    fn with_handle(rest: &[u8]) -> Vec<u8> {
        let mut payload = HANDLE.to_vec();
        payload.extend_from_slice(rest);
        payload
    }

    #[test]
    fn init_responds_then_notifies() {
        let (mut uci, manager) = setup();
        command(&mut uci, 1, 0x00, &with_handle(&[0x00]));

        assert_eq!(
            drain(&mut uci),
            alloc::vec![
                alloc::vec![0x41, 0x00, 0x00, 0x05, 0x00, 0x78, 0x56, 0x34, 0x12],
                alloc::vec![0x61, 0x02, 0x00, 0x06, 0x78, 0x56, 0x34, 0x12, 0x00, 0x00],
            ]
        );
        assert_eq!(manager.lock().session_count(Some(SessionType::Ranging)), 1);

        command(&mut uci, 1, 0x00, &with_handle(&[0x02]));
        let packets = drain(&mut uci);
        assert_eq!(packets[0], [0x41, 0x00, 0x00, 0x01, Status::ERROR_SESSION_DUPLICATE as u8]);
    }

    #[test]
    fn unmatched_type_needs_default() {
        let (mut uci, manager) = setup();
        command(&mut uci, 1, 0x00, &with_handle(&[0xA0]));
        assert_eq!(drain(&mut uci)[0], [0x41, 0x00, 0x00, 0x01, Status::REJECTED as u8]);

        manager.lock().register_default(Box::new(Minimal)).unwrap();
        command(&mut uci, 1, 0x00, &with_handle(&[0xA0]));
        assert_eq!(drain(&mut uci)[0][4], Status::OK as u8);
        assert_eq!(manager.lock().session_count(Some(SessionType::Ccc)), 1);

        // The default serving a session can't be replaced, nor can its
        // session be started through the optional operation.
        assert!(matches!(
            manager.lock().register_default(Box::new(Minimal)),
            Err(Error::Busy)
        ));
        command(&mut uci, 2, 0x00, &HANDLE);
        assert_eq!(drain(&mut uci)[0], [0x42, 0x00, 0x00, 0x01, Status::REJECTED as u8]);

        command(&mut uci, 1, 0x01, &HANDLE);
        assert_eq!(drain(&mut uci)[0], [0x41, 0x01, 0x00, 0x01, Status::OK as u8]);
        manager.lock().register_default(Box::new(Minimal)).unwrap();
    }

    #[test]
    fn session_lifecycle_drives_device_state() {
        let (mut uci, _manager) = setup();
        command(&mut uci, 1, 0x00, &with_handle(&[0x00]));
        drain(&mut uci);

        // start before configuration
        command(&mut uci, 2, 0x00, &HANDLE);
        assert_eq!(
            drain(&mut uci),
            alloc::vec![alloc::vec![
                0x42,
                0x00,
                0x00,
                0x01,
                Status::ERROR_SESSION_NOT_CONFIGURED as u8,
            ]]
        );

        command(&mut uci, 1, 0x03, &with_handle(&[1, 0x04, 1, 0x09]));
        assert_eq!(drain(&mut uci), alloc::vec![alloc::vec![0x41, 0x03, 0x00, 0x02, 0x00, 0x00]]);

        command(&mut uci, 2, 0x00, &HANDLE);
        assert_eq!(
            drain(&mut uci),
            alloc::vec![
                alloc::vec![0x42, 0x00, 0x00, 0x01, 0x00],
                alloc::vec![0x61, 0x02, 0x00, 0x06, 0x78, 0x56, 0x34, 0x12, 0x02, 0x00],
                alloc::vec![0x60, 0x01, 0x00, 0x01, DeviceState::Active as u8],
            ]
        );

        command(&mut uci, 2, 0x03, &HANDLE);
        assert_eq!(
            drain(&mut uci),
            alloc::vec![alloc::vec![0x42, 0x03, 0x00, 0x05, 0x00, 3, 0, 0, 0]]
        );

        command(&mut uci, 2, 0x01, &HANDLE);
        assert_eq!(
            drain(&mut uci),
            alloc::vec![
                alloc::vec![0x42, 0x01, 0x00, 0x01, 0x00],
                alloc::vec![0x61, 0x02, 0x00, 0x06, 0x78, 0x56, 0x34, 0x12, 0x03, 0x00],
                alloc::vec![0x60, 0x01, 0x00, 0x01, DeviceState::Ready as u8],
            ]
        );
        assert_eq!(uci.core().device_state(), DeviceState::Ready);
    }

    #[test]
    fn session_ending_on_its_own() {
        let (mut uci, manager) = setup();
        command(&mut uci, 1, 0x00, &with_handle(&[0x00]));
        command(&mut uci, 1, 0x03, &with_handle(&[0]));
        command(&mut uci, 2, 0x00, &HANDLE);
        drain(&mut uci);
        assert_eq!(uci.core().device_state(), DeviceState::Active);

        manager
            .lock()
            .with_session(uci.core(), 0x1234_5678, |ctx| {
                fake(ctx, 0x1234_5678)?.state = SessionState::Idle;
                ctx.send_session_ntf(
                    0x1234_5678,
                    SessionState::Idle,
                    reason::MAX_NUMBER_OF_MEASUREMENTS_REACHED,
                );
                Ok(())
            })
            .unwrap();
        assert_eq!(
            drain(&mut uci),
            alloc::vec![
                alloc::vec![0x61, 0x02, 0x00, 0x06, 0x78, 0x56, 0x34, 0x12, 0x03, 0x02],
                alloc::vec![0x60, 0x01, 0x00, 0x01, DeviceState::Ready as u8],
            ]
        );

        let missing = manager.lock().with_session(uci.core(), 7, |_| Ok(()));
        assert_eq!(missing, Err(Status::ERROR_SESSION_NOT_EXIST));
    }

    #[test]
    fn app_config_round_trip_and_rejection() {
        let (mut uci, _manager) = setup();
        command(&mut uci, 1, 0x00, &with_handle(&[0x00]));
        drain(&mut uci);

        command(&mut uci, 1, 0x03, &with_handle(&[2, 0x04, 1, 0x09, 0xFF, 0]));
        assert_eq!(
            drain(&mut uci),
            alloc::vec![alloc::vec![
                0x41,
                0x03,
                0x00,
                0x04,
                Status::INVALID_PARAM as u8,
                1,
                0xFF,
                Status::INVALID_PARAM as u8,
            ]]
        );

        command(&mut uci, 1, 0x04, &with_handle(&[1, 0x04]));
        assert_eq!(
            drain(&mut uci),
            alloc::vec![alloc::vec![0x41, 0x04, 0x00, 0x05, 0x00, 1, 0x04, 1, 0x09]]
        );

        command(&mut uci, 1, 0x06, &HANDLE);
        assert_eq!(drain(&mut uci), alloc::vec![alloc::vec![0x41, 0x06, 0x00, 0x02, 0x00, 0x00]]);

        command(&mut uci, 1, 0x05, &[]);
        assert_eq!(drain(&mut uci), alloc::vec![alloc::vec![0x41, 0x05, 0x00, 0x02, 0x00, 1]]);
    }

    #[test]
    fn missing_session_and_bad_payload() {
        let (mut uci, _manager) = setup();
        command(&mut uci, 2, 0x00, &[1, 0, 0, 0]);
        command(&mut uci, 1, 0x06, &[1, 0]);
        command(&mut uci, 1, 0x04, &with_handle(&[]));
        let statuses: Vec<u8> = drain(&mut uci).iter().map(|p| p[4]).collect();
        assert_eq!(
            statuses,
            [
                Status::ERROR_SESSION_NOT_EXIST as u8,
                Status::SYNTAX_ERROR as u8,
                Status::SYNTAX_ERROR as u8,
            ]
        );
    }

    #[test]
    fn controller_registration_rules() {
        let mut manager = BackendManager::new();
        assert!(matches!(manager.register(Fake::boxed(&[])), Err(Error::InvalidArgument)));
        assert!(matches!(
            manager.register(Fake::boxed(&[
                SessionType::Ranging,
                SessionType::Ccc,
                SessionType::Radar,
            ])),
            Err(Error::InvalidArgument)
        ));

        let fira = manager.register(Fake::boxed(&[SessionType::Ranging])).unwrap();
        assert!(matches!(
            manager.register(Fake::boxed(&[SessionType::Radar, SessionType::Ranging])),
            Err(Error::Busy)
        ));
        manager.register(Fake::boxed(&[SessionType::Radar])).unwrap();

        assert!(manager.unregister(fira).is_ok());
        assert!(matches!(manager.unregister(fira), Err(Error::InvalidArgument)));
        manager.register(Fake::boxed(&[SessionType::Ranging])).unwrap();
    }

    #[test]
    fn sessions_route_to_their_owner() {
        let (mut uci, manager) = setup();
        let ccc = manager.lock().register(Fake::boxed(&[SessionType::Ccc])).unwrap();

        command(&mut uci, 1, 0x00, &[1, 0, 0, 0, 0x00]);
        command(&mut uci, 1, 0x00, &[2, 0, 0, 0, 0xA0]);
        drain(&mut uci);

        {
            let manager = manager.lock();
            assert_eq!(manager.sessions().find(2).map(Session::owner), Some(ccc));
            assert_ne!(manager.sessions().find(1).map(Session::owner), Some(ccc));
        }
        assert!(matches!(manager.lock().unregister(ccc), Err(Error::Busy)));

        command(&mut uci, 1, 0x01, &[2, 0, 0, 0]);
        assert_eq!(drain(&mut uci)[0], [0x41, 0x01, 0x00, 0x01, 0x00]);
        assert!(manager.lock().unregister(ccc).is_ok());
        assert_eq!(manager.lock().session_count(None), 1);
    }

    #[test]
    fn coordinator_arbitrates_regions() {
        let (mut uci, manager) = setup();
        manager.lock().register(Fake::boxed(&[SessionType::Ccc])).unwrap();
        let regions = RegionTable::new().with_region("fira", "fira_sched", 1);
        manager.lock().set_coordinator(Some(Box::new(regions)));

        for (handle, stype) in [(1u8, 0x00u8), (2, 0xA0)] {
            command(&mut uci, 1, 0x00, &[handle, 0, 0, 0, stype]);
            command(&mut uci, 1, 0x03, &[handle, 0, 0, 0, 0]);
        }
        drain(&mut uci);

        command(&mut uci, 2, 0x00, &[1, 0, 0, 0]);
        assert_eq!(drain(&mut uci)[0][4], Status::OK as u8);
        command(&mut uci, 2, 0x00, &[2, 0, 0, 0]);
        assert_eq!(drain(&mut uci)[0][4], Status::REJECTED as u8);

        command(&mut uci, 2, 0x01, &[1, 0, 0, 0]);
        drain(&mut uci);
        command(&mut uci, 2, 0x00, &[2, 0, 0, 0]);
        assert_eq!(drain(&mut uci)[0][4], Status::OK as u8);
    }
}
