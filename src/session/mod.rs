//! Session tracking and backend dispatch
//!
//! Ranging backends (FiRa, CCC, radar, test) implement [`SessionController`]
//! and register with a [`BackendManager`]. The manager serves the session
//! configuration and session control groups: it resolves which controller
//! owns a session, forwards the command and builds the response.
//!
//! Sessions live in the manager's [`SessionTable`]. A controller reaches them
//! through the [`BackendContext`] it is handed, which only lets it touch the
//! sessions it created.

use alloc::{boxed::Box, vec::Vec};
use core::any::Any;

#[cfg(feature = "defmt")]
use defmt::Format;

pub use coordinator::*;
pub use manager::*;

use crate::{
    message::{MessageReader, MessageWriter},
    uci::{Error, UciCore},
    Status,
};

mod coordinator;
mod manager;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// Session type carried by `SESSION_INIT`
pub enum SessionType {
    /// FiRa ranging session
    Ranging,
    /// FiRa ranging with in-band data
    RangingAndInBandData,
    /// FiRa data transfer
    DataTransfer,
    /// Ranging only phase
    RangingOnlyPhase,
    /// In-band data phase
    InBandDataPhase,
    /// Ranging with data phase
    RangingWithDataPhase,
    /// CCC digital key ranging
    Ccc,
    /// Radar
    Radar,
    /// Device test mode (PCTT)
    DeviceTest,
    /// Any other, vendor specific, value
    Other(u8),
}

impl SessionType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => SessionType::Ranging,
            0x01 => SessionType::RangingAndInBandData,
            0x02 => SessionType::DataTransfer,
            0x03 => SessionType::RangingOnlyPhase,
            0x04 => SessionType::InBandDataPhase,
            0x05 => SessionType::RangingWithDataPhase,
            0xA0 => SessionType::Ccc,
            0xA1 => SessionType::Radar,
            0xD0 => SessionType::DeviceTest,
            other => SessionType::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            SessionType::Ranging => 0x00,
            SessionType::RangingAndInBandData => 0x01,
            SessionType::DataTransfer => 0x02,
            SessionType::RangingOnlyPhase => 0x03,
            SessionType::InBandDataPhase => 0x04,
            SessionType::RangingWithDataPhase => 0x05,
            SessionType::Ccc => 0xA0,
            SessionType::Radar => 0xA1,
            SessionType::DeviceTest => 0xD0,
            SessionType::Other(other) => other,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
/// Session state reported by `SESSION_GET_STATE` and `SESSION_STATUS_NTF`
pub enum SessionState {
    Init = 0x00,
    Deinit = 0x01,
    Active = 0x02,
    Idle = 0x03,
}

/// Reason codes of `SESSION_STATUS_NTF`
pub mod reason {
    pub const STATE_CHANGE_WITH_SESSION_MANAGEMENT_COMMANDS: u8 = 0x00;
    pub const MAX_RANGING_ROUND_RETRY_COUNT_REACHED: u8 = 0x01;
    pub const MAX_NUMBER_OF_MEASUREMENTS_REACHED: u8 = 0x02;
    pub const SESSION_SUSPENDED_DUE_TO_INBAND_SIGNAL: u8 = 0x03;
    pub const SESSION_RESUMED_DUE_TO_INBAND_SIGNAL: u8 = 0x04;
    pub const SESSION_STOPPED_DUE_TO_INBAND_SIGNAL: u8 = 0x05;
    pub const ERROR_SLOT_LENGTH_NOT_SUPPORTED: u8 = 0x20;
    pub const ERROR_INSUFFICIENT_SLOTS_PER_RR: u8 = 0x21;
    pub const ERROR_MAC_ADDRESS_MODE_NOT_SUPPORTED: u8 = 0x22;
    pub const ERROR_INVALID_RANGING_DURATION: u8 = 0x23;
    pub const ERROR_INVALID_STS_CONFIG: u8 = 0x24;
    pub const ERROR_INVALID_RFRAME_CONFIG: u8 = 0x25;
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
/// How angle of arrival results are reported
pub enum AoaResultRequest {
    NoAoaReport = 0x00,
    #[default]
    ReqAoaResults = 0x01,
    ReqAoaResultsAzimuthOnly = 0x02,
    ReqAoaResultsElevationOnly = 0x03,
    ReqAoaResultsInterleaved = 0xF0,
}

/// Measurement counts cached per session
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MeasurementCounters {
    /// Ranging rounds attempted
    pub ranging_rounds: u32,
    /// Two way ranging measurements
    pub two_way: u32,
    /// Downlink TDoA measurements
    pub dl_tdoa: u32,
    /// One way ranging AoA measurements
    pub owr_aoa: u32,
}

/// Identifies a registered controller
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct ControllerId(u32);

/// An active session
pub struct Session {
    handle: u32,
    stype: SessionType,
    owner: ControllerId,
    /// Cached measurement counts
    pub counters: MeasurementCounters,
    /// AoA report mode
    pub aoa_result_req: AoaResultRequest,
    data: Box<dyn Any + Send>,
}

impl Session {
    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn session_type(&self) -> SessionType {
        self.stype
    }

    pub fn owner(&self) -> ControllerId {
        self.owner
    }

    /// Backend data attached at creation
    pub fn data<T: 'static>(&self) -> Option<&T> {
        self.data.downcast_ref()
    }

    /// Mutable backend data attached at creation
    pub fn data_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.data.downcast_mut()
    }
}

/// Sessions known to the manager
#[derive(Default)]
pub struct SessionTable {
    sessions: Vec<Session>,
}

impl SessionTable {
    /// Adds a session, `FAILED` if the handle is taken
    pub fn add(
        &mut self,
        handle: u32,
        stype: SessionType,
        owner: ControllerId,
        data: Box<dyn Any + Send>,
    ) -> Result<(), Status> {
        if self.find(handle).is_some() {
            warn!("session {} already exists", handle);
            return Err(Status::FAILED);
        }
        self.sessions.push(Session {
            handle,
            stype,
            owner,
            counters: MeasurementCounters::default(),
            aoa_result_req: AoaResultRequest::default(),
            data,
        });
        debug!("session {} added", handle);
        Ok(())
    }

    /// Session `handle` if it is owned by `owner`
    pub fn get(&mut self, handle: u32, owner: ControllerId) -> Result<&mut Session, Status> {
        let session = self
            .sessions
            .iter_mut()
            .find(|s| s.handle == handle)
            .ok_or(Status::ERROR_SESSION_NOT_EXIST)?;
        if session.owner != owner {
            warn!("session {} is owned by another controller", handle);
            return Err(Status::FAILED);
        }
        Ok(session)
    }

    /// Removes session `handle` if it is owned by `owner`, dropping its data
    pub fn remove(&mut self, handle: u32, owner: ControllerId) -> Result<(), Status> {
        self.get(handle, owner)?;
        self.sessions.retain(|s| s.handle != handle);
        debug!("session {} removed", handle);
        Ok(())
    }

    /// Number of sessions of the given type, or of any type with `None`
    pub fn count(&self, stype: Option<SessionType>) -> usize {
        self.sessions
            .iter()
            .filter(|s| stype.map_or(true, |t| s.stype == t))
            .count()
    }

    /// Looks a session up without ownership check
    pub fn find(&self, handle: u32) -> Option<&Session> {
        self.sessions.iter().find(|s| s.handle == handle)
    }

    /// Iterates over every session
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }
}

/// A ranging backend
///
/// A controller declares the one or two session types it serves. The
/// manager forwards session commands for those types to it. Operations
/// return the status to put in the response.
pub trait SessionController: Send {
    /// Session types served, one or two
    fn session_types(&self) -> &[SessionType];

    /// `SESSION_INIT`, the controller creates the session with
    /// [`BackendContext::session_add`]
    fn init(
        &mut self,
        ctx: &mut BackendContext<'_>,
        handle: u32,
        stype: SessionType,
    ) -> Result<(), Status>;

    /// `SESSION_DEINIT`, the controller drops the session with
    /// [`BackendContext::session_remove`]
    fn deinit(&mut self, ctx: &mut BackendContext<'_>, handle: u32) -> Result<(), Status>;

    /// `SESSION_START`
    fn start(&mut self, _ctx: &mut BackendContext<'_>, _handle: u32) -> Result<(), Status> {
        Err(Status::REJECTED)
    }

    /// `SESSION_STOP`
    fn stop(&mut self, _ctx: &mut BackendContext<'_>, _handle: u32) -> Result<(), Status> {
        Err(Status::REJECTED)
    }

    /// `SESSION_SET_APP_CONFIG`
    ///
    /// `tlvs` is positioned on the first TLV. `out` receives the response
    /// body following the status: the number of rejected parameters and
    /// their `(id, status)` pairs.
    fn set_app_config(
        &mut self,
        ctx: &mut BackendContext<'_>,
        handle: u32,
        count: u8,
        tlvs: &mut MessageReader<'_>,
        out: &mut MessageWriter,
    ) -> Result<(), Status>;

    /// `SESSION_GET_APP_CONFIG`
    ///
    /// `ids` lists the requested parameters, all of them when empty. `out`
    /// receives the response body following the status: the number of TLVs
    /// and the TLVs.
    fn get_app_config(
        &mut self,
        ctx: &mut BackendContext<'_>,
        handle: u32,
        ids: &[u8],
        out: &mut MessageWriter,
    ) -> Result<(), Status>;

    /// `SESSION_GET_STATE`
    fn get_state(
        &mut self,
        ctx: &mut BackendContext<'_>,
        handle: u32,
    ) -> Result<SessionState, Status>;

    /// State of a session, without a command involved
    ///
    /// Used to derive the device state from session activity.
    fn get_current_state(&mut self, session: &Session) -> SessionState;

    /// `SESSION_GET_RANGING_COUNT`
    fn get_ranging_count(
        &mut self,
        ctx: &mut BackendContext<'_>,
        handle: u32,
    ) -> Result<u32, Status>;
}

/// Session state notification waiting for the command response
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub(crate) struct SessionNtf {
    pub handle: u32,
    pub state: SessionState,
    pub reason: u8,
}

/// What a controller sees while serving a command
pub struct BackendContext<'a> {
    core: &'a mut UciCore,
    sessions: &'a mut SessionTable,
    coordinator: Option<&'a mut (dyn Coordinator + 'static)>,
    controller: ControllerId,
    pending: &'a mut Vec<SessionNtf>,
}

impl<'a> BackendContext<'a> {
    /// Engine core, to send other notifications
    pub fn core(&mut self) -> &mut UciCore {
        self.core
    }

    /// Identity of the controller being served
    pub fn controller(&self) -> ControllerId {
        self.controller
    }

    /// Creates a session owned by the calling controller
    pub fn session_add(
        &mut self,
        handle: u32,
        stype: SessionType,
        data: Box<dyn Any + Send>,
    ) -> Result<(), Status> {
        self.sessions.add(handle, stype, self.controller, data)
    }

    /// One of the calling controller's sessions
    pub fn session(&mut self, handle: u32) -> Result<&mut Session, Status> {
        self.sessions.get(handle, self.controller)
    }

    /// Drops one of the calling controller's sessions
    pub fn session_remove(&mut self, handle: u32) -> Result<(), Status> {
        self.sessions.remove(handle, self.controller)
    }

    /// Number of sessions of all controllers
    pub fn session_count(&self, stype: Option<SessionType>) -> usize {
        self.sessions.count(stype)
    }

    /// Queues a `SESSION_STATUS_NTF`, sent after the command response
    pub fn send_session_ntf(&mut self, handle: u32, state: SessionState, reason: u8) {
        self.pending.push(SessionNtf {
            handle,
            state,
            reason,
        });
    }

    /// Claims a MAC region, always granted without a coordinator
    pub fn request_region(&mut self, region: &str) -> Result<(), Error> {
        match self.coordinator.as_mut() {
            Some(coordinator) => coordinator.request_region(self.controller, region),
            None => Ok(()),
        }
    }

    /// Releases a MAC region
    pub fn release_region(&mut self, region: &str) -> Result<(), Error> {
        match self.coordinator.as_mut() {
            Some(coordinator) => coordinator.release_region(self.controller, region),
            None => Ok(()),
        }
    }

    /// Scheduler serving `region`
    pub fn scheduler(&self, region: &str) -> Option<&str> {
        self.coordinator.as_ref()?.get_scheduler(region)
    }

    /// Identifier of `region`
    pub fn region_id(&self, region: &str) -> Option<u32> {
        self.coordinator.as_ref()?.get_region_id(region)
    }
}
