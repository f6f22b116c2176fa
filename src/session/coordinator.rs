use alloc::vec::Vec;

use super::ControllerId;
use crate::uci::Error;

/// Arbitrates MAC regions between session backends
///
/// A backend asks for a region by name and learns which scheduler serves it
/// without knowing how the integrator laid the regions out.
pub trait Coordinator: Send {
    /// Claims `region` for `controller`
    fn request_region(&mut self, controller: ControllerId, region: &str) -> Result<(), Error>;

    /// Gives `region` back
    fn release_region(&mut self, controller: ControllerId, region: &str) -> Result<(), Error>;

    /// Name of the scheduler serving `region`
    fn get_scheduler(&self, region: &str) -> Option<&str>;

    /// Identifier of `region`
    fn get_region_id(&self, region: &str) -> Option<u32>;
}

struct Region {
    name: &'static str,
    scheduler: &'static str,
    id: u32,
    holder: Option<ControllerId>,
}

/// Coordinator backed by a fixed table of regions
///
/// A region is held by at most one controller at a time. Requesting a
/// region already held by the caller succeeds.
#[derive(Default)]
pub struct RegionTable {
    regions: Vec<Region>,
}

impl RegionTable {
    pub fn new() -> Self {
        RegionTable::default()
    }

    /// Adds a region served by `scheduler`
    pub fn with_region(mut self, name: &'static str, scheduler: &'static str, id: u32) -> Self {
        self.regions.push(Region {
            name,
            scheduler,
            id,
            holder: None,
        });
        self
    }

    /// Controller currently holding `region`
    pub fn holder(&self, region: &str) -> Option<ControllerId> {
        self.find(region)?.holder
    }

    fn find(&self, region: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.name == region)
    }

    fn find_mut(&mut self, region: &str) -> Result<&mut Region, Error> {
        self.regions
            .iter_mut()
            .find(|r| r.name == region)
            .ok_or(Error::InvalidArgument)
    }
}

impl Coordinator for RegionTable {
    fn request_region(&mut self, controller: ControllerId, region: &str) -> Result<(), Error> {
        let entry = self.find_mut(region)?;
        match entry.holder {
            Some(holder) if holder != controller => {
                warn!("region {} is held by another controller", entry.id);
                Err(Error::Busy)
            }
            _ => {
                entry.holder = Some(controller);
                Ok(())
            }
        }
    }

    fn release_region(&mut self, controller: ControllerId, region: &str) -> Result<(), Error> {
        let entry = self.find_mut(region)?;
        if entry.holder != Some(controller) {
            return Err(Error::InvalidArgument);
        }
        entry.holder = None;
        Ok(())
    }

    fn get_scheduler(&self, region: &str) -> Option<&str> {
        Some(self.find(region)?.scheduler)
    }

    fn get_region_id(&self, region: &str) -> Option<u32> {
        Some(self.find(region)?.id)
    }
}
