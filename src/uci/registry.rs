use alloc::{boxed::Box, vec::Vec};

#[cfg(feature = "defmt")]
use defmt::Format;

use super::{Error, UciCore};
use crate::{
    block::Block,
    packet::{MessageId, MessageType},
    Status,
};

/// Handler called with a complete message
///
/// Returning `Ok` means the handler took care of any response. An error
/// returned for a command makes the core answer with a status response:
/// the carried status for [`Error::Status`], `FAILED` otherwise.
pub type HandlerFn<T> = fn(
    core: &mut UciCore,
    user_data: &mut T,
    id: MessageId,
    payload: Option<Block>,
) -> Result<(), Error>;

/// Identifies a registered batch, used to unregister it
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct HandlerToken(u32);

/// A batch of handlers for one group, with the data they share
pub struct MessageHandlers<T> {
    entries: Vec<(MessageId, HandlerFn<T>)>,
    user_data: T,
}

impl<T> MessageHandlers<T> {
    /// Builds a batch, entries are sorted by message id
    pub fn new(entries: &[(MessageId, HandlerFn<T>)], user_data: T) -> Self {
        let mut entries = entries.to_vec();
        entries.sort_by_key(|(id, _)| *id);
        MessageHandlers { entries, user_data }
    }

    /// Shared handler data
    pub fn user_data(&self) -> &T {
        &self.user_data
    }

    fn group(&self) -> Option<Group> {
        let (first, rest) = self.entries.split_first()?;
        let group = Group::of(first.0);
        if rest.iter().all(|(id, _)| Group::of(*id) == group) {
            Some(group)
        } else {
            None
        }
    }

    fn has_duplicates(&self) -> bool {
        self.entries.windows(2).any(|pair| pair[0].0 == pair[1].0)
    }
}

/// Group a batch serves. Data messages are grouped apart from the control
/// groups since their low nibble is a packet format, not a group id.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Group {
    Data,
    Control(u8),
}

impl Group {
    fn of(id: MessageId) -> Self {
        match id.mt() {
            MessageType::Data => Group::Data,
            _ => Group::Control(id.gid()),
        }
    }
}

trait HandlerTable: Send {
    fn group(&self) -> Group;
    fn find(&self, id: MessageId) -> Option<usize>;
    fn call(
        &mut self,
        index: usize,
        core: &mut UciCore,
        id: MessageId,
        payload: Option<Block>,
    ) -> Result<(), Error>;
}

struct Registered<T> {
    group: Group,
    handlers: MessageHandlers<T>,
}

impl<T: Send> HandlerTable for Registered<T> {
    fn group(&self) -> Group {
        self.group
    }

    fn find(&self, id: MessageId) -> Option<usize> {
        self.handlers
            .entries
            .binary_search_by_key(&id, |(id, _)| *id)
            .ok()
    }

    fn call(
        &mut self,
        index: usize,
        core: &mut UciCore,
        id: MessageId,
        payload: Option<Block>,
    ) -> Result<(), Error> {
        let handler = self.handlers.entries[index].1;
        handler(core, &mut self.handlers.user_data, id, payload)
    }
}

/// Registered handler batches and the known group bitmask
#[derive(Default)]
pub(crate) struct Registry {
    batches: Vec<(HandlerToken, Box<dyn HandlerTable>)>,
    known_gids: u16,
    next_token: u32,
}

impl Registry {
    pub(crate) fn register<T: Send + 'static>(
        &mut self,
        handlers: MessageHandlers<T>,
    ) -> Result<HandlerToken, Error> {
        let Some(group) = handlers.group() else {
            warn!("handler batch is empty or mixes groups, rejected");
            return Err(Error::InvalidArgument);
        };
        if handlers.has_duplicates() {
            warn!("handler batch registers an id twice, rejected");
            return Err(Error::InvalidArgument);
        }

        let token = HandlerToken(self.next_token);
        self.next_token = self.next_token.wrapping_add(1);
        self.batches
            .push((token, Box::new(Registered { group, handlers })));
        self.update_known_gids();

        debug!("registered handler batch {}", token.0);
        Ok(token)
    }

    pub(crate) fn unregister(&mut self, token: HandlerToken) -> Result<(), Error> {
        let index = self
            .batches
            .iter()
            .position(|(t, _)| *t == token)
            .ok_or(Error::InvalidArgument)?;
        self.batches.remove(index);
        self.update_known_gids();
        Ok(())
    }

    fn update_known_gids(&mut self) {
        self.known_gids = self
            .batches
            .iter()
            .filter_map(|(_, batch)| match batch.group() {
                Group::Control(gid) => Some(1u16 << gid),
                Group::Data => None,
            })
            .fold(0, |mask, bit| mask | bit);
    }

    /// `true` if some batch serves the group of `id`
    pub(crate) fn is_known(&self, id: MessageId) -> bool {
        match Group::of(id) {
            Group::Control(gid) => self.known_gids & (1 << gid) != 0,
            Group::Data => self
                .batches
                .iter()
                .any(|(_, batch)| batch.group() == Group::Data),
        }
    }

    /// Hands a message to the handler registered for its id
    ///
    /// Misses are reported as `UNKNOWN_GID` when no batch serves the group and
    /// `UNKNOWN_OID` when the group is served but the opcode is not.
    pub(crate) fn dispatch(
        &mut self,
        core: &mut UciCore,
        id: MessageId,
        payload: Option<Block>,
    ) -> Result<(), Error> {
        if !self.is_known(id) {
            debug!("no handler for group {}", id.gid());
            return Err(Error::Status(Status::UNKNOWN_GID));
        }

        let group = Group::of(id);
        for (_, batch) in self.batches.iter_mut() {
            if batch.group() != group {
                continue;
            }
            if let Some(index) = batch.find(id) {
                return batch.call(index, core, id, payload);
            }
        }

        debug!("no handler for opcode {} of group {}", id.oid(), id.gid());
        Err(Error::Status(Status::UNKNOWN_OID))
    }
}
