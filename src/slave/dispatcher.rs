use std::sync::Arc;

use tokio_modbus::{Address, Quantity, SlaveId};
use tracing::debug;

use crate::error::RequestError;

use super::registers::{Coil, Word};
use super::store::RegisterStore;
use super::stats::StatsSnapshot;

/// What a request wants to do with a read/write table.
#[derive(Debug, Clone, Copy)]
pub enum Access<'a, T> {
    Read { addr: Address, quantity: Quantity },
    Write { addr: Address, values: &'a [T] },
}

impl<T> Access<'_, T> {
    fn operation(&self) -> &'static str {
        match self {
            Access::Read { .. } => "read",
            Access::Write { .. } => "write",
        }
    }

    fn range(&self) -> (Address, usize) {
        match *self {
            Access::Read { addr, quantity } => (addr, usize::from(quantity)),
            Access::Write { addr, values } => (addr, values.len()),
        }
    }
}

/// The surface a transport drives with already decoded requests, one
/// entry point per table. Read-only tables have no write form.
pub trait RequestHandler: Send + Sync + 'static {
    fn holding_registers(
        &self,
        unit_id: SlaveId,
        access: Access<'_, Word>,
    ) -> Result<Vec<Word>, RequestError>;

    fn input_registers(
        &self,
        unit_id: SlaveId,
        addr: Address,
        quantity: Quantity,
    ) -> Result<Vec<Word>, RequestError>;

    fn coils(&self, unit_id: SlaveId, access: Access<'_, Coil>) -> Result<Vec<Coil>, RequestError>;

    fn discrete_inputs(
        &self,
        unit_id: SlaveId,
        addr: Address,
        quantity: Quantity,
    ) -> Result<Vec<Coil>, RequestError>;
}

/// Routes decoded requests onto the [`RegisterStore`].
#[derive(Debug, Clone)]
pub struct Dispatcher {
    store: Arc<RegisterStore>,
}

impl Dispatcher {
    pub fn new(store: Arc<RegisterStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<RegisterStore> {
        &self.store
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.store.snapshot_stats()
    }
}

impl RequestHandler for Dispatcher {
    fn holding_registers(
        &self,
        unit_id: SlaveId,
        access: Access<'_, Word>,
    ) -> Result<Vec<Word>, RequestError> {
        let res = match access {
            Access::Read { addr, quantity } => self.store.read_holding(unit_id, addr, quantity),
            Access::Write { addr, values } => self.store.write_holding(unit_id, addr, values),
        }?;

        let (start, quantity) = access.range();
        debug!(
            operation = access.operation(),
            unit_id,
            start,
            quantity,
            "Holding registers handled"
        );
        Ok(res)
    }

    fn input_registers(
        &self,
        unit_id: SlaveId,
        addr: Address,
        quantity: Quantity,
    ) -> Result<Vec<Word>, RequestError> {
        let res = self.store.read_input(unit_id, addr, quantity)?;
        debug!(unit_id, start = addr, quantity, "Input registers handled");
        Ok(res)
    }

    fn coils(&self, unit_id: SlaveId, access: Access<'_, Coil>) -> Result<Vec<Coil>, RequestError> {
        let res = match access {
            Access::Read { addr, quantity } => self.store.read_coils(unit_id, addr, quantity),
            Access::Write { addr, values } => self.store.write_coils(unit_id, addr, values),
        }?;

        let (start, quantity) = access.range();
        debug!(
            operation = access.operation(),
            unit_id,
            start,
            quantity,
            "Coils handled"
        );
        Ok(res)
    }

    fn discrete_inputs(
        &self,
        unit_id: SlaveId,
        addr: Address,
        quantity: Quantity,
    ) -> Result<Vec<Coil>, RequestError> {
        let res = self.store.read_discrete(unit_id, addr, quantity)?;
        debug!(unit_id, start = addr, quantity, "Discrete inputs handled");
        Ok(res)
    }
}
