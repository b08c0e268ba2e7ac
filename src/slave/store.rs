use parking_lot::RwLock;
use tokio_modbus::{Address, Quantity, SlaveId};
use tracing::{debug, info, warn};

use crate::config::ModbusConfig;
use crate::error::{ConfigError, RequestError};

use super::registers::{Coil, SeedEntry, TableKind, Tables, Word};
use super::stats::{Stats, StatsSnapshot};

/// The device data model shared by every connection and the counter loop.
///
/// All table access goes through these methods; they are the only places
/// the lock is taken. Identity and bounds checks run before the lock.
#[derive(Debug)]
pub struct RegisterStore {
    unit_id: SlaveId,
    counter_address: Address,
    len: usize,
    tables: RwLock<Tables>,
    stats: Stats,
}

impl RegisterStore {
    pub fn new(config: &ModbusConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut tables = Tables::new(config.max_registers);
        for raw in &config.initial_data {
            let seed = match SeedEntry::try_from(raw) {
                Ok(seed) => seed,
                Err(kind) => {
                    warn!(kind = %kind, "Unknown initial data type in config, skipping");
                    continue;
                }
            };
            if !tables.apply(seed) {
                warn!(
                    table = %seed.kind(),
                    address = seed.addr(),
                    max = config.max_registers,
                    "Initial data address out of bounds, skipping"
                );
            }
        }
        tables.holding[usize::from(config.counter_address)] = 0;

        info!(
            max_registers = config.max_registers,
            unit_id = config.unit_id,
            counter_address = config.counter_address,
            "Register store initialized"
        );

        Ok(Self {
            unit_id: config.unit_id,
            counter_address: config.counter_address,
            len: config.max_registers,
            tables: RwLock::new(tables),
            stats: Stats::new(),
        })
    }

    /// Counts the request and rejects it if it is for another unit or runs
    /// past the end of the tables.
    fn admit(
        &self,
        kind: TableKind,
        unit_id: SlaveId,
        addr: Address,
        quantity: usize,
    ) -> Result<(), RequestError> {
        self.stats.record_request();

        if unit_id != self.unit_id {
            self.stats.record_identity_error();
            warn!(
                table = %kind,
                requested = unit_id,
                expected = self.unit_id,
                "Invalid unit ID"
            );
            return Err(RequestError::IdentityMismatch {
                requested: unit_id,
                expected: self.unit_id,
            });
        }

        if usize::from(addr) + quantity > self.len {
            self.stats.record_address_error();
            warn!(
                table = %kind,
                start = addr,
                quantity,
                max = self.len,
                "Address out of bounds"
            );
            return Err(RequestError::AddressOutOfRange {
                addr,
                quantity,
                len: self.len,
            });
        }

        Ok(())
    }

    pub fn read_holding(
        &self,
        unit_id: SlaveId,
        addr: Address,
        quantity: Quantity,
    ) -> Result<Vec<Word>, RequestError> {
        let quantity = usize::from(quantity);
        self.admit(TableKind::Holding, unit_id, addr, quantity)?;
        let tables = self.tables.read();
        Ok(window(&tables.holding, addr, quantity).to_vec())
    }

    /// Overwrites `values.len()` registers starting at `addr` and returns the
    /// resulting contents of that range. The counter slot keeps its value.
    pub fn write_holding(
        &self,
        unit_id: SlaveId,
        addr: Address,
        values: &[Word],
    ) -> Result<Vec<Word>, RequestError> {
        let quantity = values.len();
        self.admit(TableKind::Holding, unit_id, addr, quantity)?;

        let mut tables = self.tables.write();
        let start = usize::from(addr);
        for (offset, &value) in values.iter().enumerate() {
            let idx = start + offset;
            if idx == usize::from(self.counter_address) {
                debug!(address = idx, attempted = value, "Write to counter register ignored");
                continue;
            }
            let old = std::mem::replace(&mut tables.holding[idx], value);
            debug!(address = idx, old, new = value, "Register written");
        }
        Ok(window(&tables.holding, addr, quantity).to_vec())
    }

    pub fn read_input(
        &self,
        unit_id: SlaveId,
        addr: Address,
        quantity: Quantity,
    ) -> Result<Vec<Word>, RequestError> {
        let quantity = usize::from(quantity);
        self.admit(TableKind::Input, unit_id, addr, quantity)?;
        let tables = self.tables.read();
        Ok(window(&tables.input, addr, quantity).to_vec())
    }

    pub fn read_coils(
        &self,
        unit_id: SlaveId,
        addr: Address,
        quantity: Quantity,
    ) -> Result<Vec<Coil>, RequestError> {
        let quantity = usize::from(quantity);
        self.admit(TableKind::Coil, unit_id, addr, quantity)?;
        let tables = self.tables.read();
        Ok(window(&tables.coils, addr, quantity).to_vec())
    }

    pub fn write_coils(
        &self,
        unit_id: SlaveId,
        addr: Address,
        values: &[Coil],
    ) -> Result<Vec<Coil>, RequestError> {
        let quantity = values.len();
        self.admit(TableKind::Coil, unit_id, addr, quantity)?;

        let mut tables = self.tables.write();
        let start = usize::from(addr);
        tables.coils[start..start + quantity].copy_from_slice(values);
        Ok(window(&tables.coils, addr, quantity).to_vec())
    }

    pub fn read_discrete(
        &self,
        unit_id: SlaveId,
        addr: Address,
        quantity: Quantity,
    ) -> Result<Vec<Coil>, RequestError> {
        let quantity = usize::from(quantity);
        self.admit(TableKind::Discrete, unit_id, addr, quantity)?;
        let tables = self.tables.read();
        Ok(window(&tables.discrete, addr, quantity).to_vec())
    }

    /// Advances the live counter and mirrors it into its holding register.
    /// Wraps to 1, never 0.
    pub fn increment_counter(&self) -> Word {
        let mut tables = self.tables.write();
        let old = tables.counter;
        let mut new = old.wrapping_add(1);
        if new == 0 {
            warn!(address = self.counter_address, "Counter overflow, resetting");
            new = 1;
        }
        tables.counter = new;
        tables.holding[usize::from(self.counter_address)] = new;

        debug!(address = self.counter_address, old, new, "Counter updated");
        new
    }

    pub fn counter_value(&self) -> Word {
        self.tables.read().counter
    }

    pub fn snapshot_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

fn window<T>(table: &[T], addr: Address, quantity: usize) -> &[T] {
    let start = usize::from(addr);
    &table[start..start + quantity]
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::config::RegisterValue;

    fn config() -> ModbusConfig {
        ModbusConfig {
            unit_id: 1,
            max_registers: 200,
            counter_address: 10,
            update_interval: 1,
            initial_data: vec![],
        }
    }

    fn store() -> RegisterStore {
        RegisterStore::new(&config()).unwrap()
    }

    fn seed(kind: &str, address: u16, value: u16) -> RegisterValue {
        RegisterValue {
            kind: kind.to_string(),
            address,
            value,
        }
    }

    #[test]
    fn holding_write_then_read() {
        let store = store();
        assert_eq!(store.write_holding(1, 5, &[12345]).unwrap(), vec![12345]);
        assert_eq!(store.read_holding(1, 5, 1).unwrap(), vec![12345]);
    }

    #[test]
    fn coil_write_then_read() {
        let store = store();
        store.write_coils(1, 198, &[true, false]).unwrap();
        store.write_coils(1, 199, &[true]).unwrap();
        assert_eq!(store.read_coils(1, 197, 3).unwrap(), vec![false, true, true]);
    }

    #[test]
    fn counter_increments_are_visible_and_writes_are_ignored() {
        let store = store();
        for _ in 0..5 {
            store.increment_counter();
        }
        assert_eq!(store.read_holding(1, 10, 1).unwrap(), vec![5]);

        store.write_holding(1, 10, &[999]).unwrap();
        assert_eq!(store.read_holding(1, 10, 1).unwrap(), vec![5]);
    }

    #[test]
    fn multi_write_across_counter_skips_only_counter() {
        let store = store();
        store.increment_counter();

        let post = store.write_holding(1, 9, &[7, 8, 9]).unwrap();
        assert_eq!(post, vec![7, 1, 9]);
        assert_eq!(store.read_holding(1, 9, 3).unwrap(), vec![7, 1, 9]);
    }

    #[test]
    fn counter_wraps_to_one() {
        let store = store();
        let mut last = 0;
        for _ in 0..u16::MAX {
            let next = store.increment_counter();
            assert!(next > last);
            last = next;
        }
        assert_eq!(last, u16::MAX);
        assert_eq!(store.increment_counter(), 1);
        assert_eq!(store.read_holding(1, 10, 1).unwrap(), vec![1]);
        assert_eq!(store.counter_value(), 1);
    }

    #[test]
    fn overrun_is_rejected_and_table_untouched() {
        let store = store();
        let err = store.read_holding(1, 199, 5).unwrap_err();
        assert_eq!(
            err,
            RequestError::AddressOutOfRange {
                addr: 199,
                quantity: 5,
                len: 200
            }
        );

        assert!(store.write_holding(1, 198, &[1, 2, 3]).is_err());
        assert_eq!(store.read_holding(1, 198, 2).unwrap(), vec![0, 0]);

        assert!(store.write_coils(1, 199, &[true, true]).is_err());
        assert_eq!(store.read_coils(1, 199, 1).unwrap(), vec![false]);

        assert!(store.read_input(1, 200, 1).is_err());
        assert!(store.read_discrete(1, 150, 51).is_err());
    }

    #[test]
    fn full_range_is_in_bounds() {
        let store = store();
        assert_eq!(store.read_input(1, 0, 200).unwrap().len(), 200);
        assert_eq!(store.read_discrete(1, 200, 0).unwrap().len(), 0);
    }

    #[test]
    fn wrong_unit_is_rejected_before_bounds() {
        let store = store();
        store.write_holding(1, 0, &[42]).unwrap();
        let before = store.snapshot_stats();

        let err = store.read_holding(99, 60000, 10).unwrap_err();
        assert_eq!(err.exception_code(), tokio_modbus::ExceptionCode::IllegalFunction);
        assert!(matches!(err, RequestError::IdentityMismatch { requested: 99, expected: 1 }));

        assert!(store.write_holding(99, 0, &[7]).is_err());
        assert!(store.write_coils(99, 0, &[true]).is_err());

        let after = store.snapshot_stats();
        assert_eq!(after.errors - before.errors, 3);
        assert_eq!(after.identity_errors - before.identity_errors, 3);
        assert_eq!(after.address_errors, before.address_errors);
        assert_eq!(store.read_holding(1, 0, 1).unwrap(), vec![42]);
        assert_eq!(store.read_coils(1, 0, 1).unwrap(), vec![false]);
    }

    #[test]
    fn every_request_is_counted() {
        let store = store();
        store.read_input(1, 0, 1).unwrap();
        store.read_input(2, 0, 1).unwrap_err();
        store.read_input(1, 500, 1).unwrap_err();
        store.increment_counter();

        let stats = store.snapshot_stats();
        assert_eq!(stats.requests_handled, 3);
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.identity_errors, 1);
        assert_eq!(stats.address_errors, 1);
    }

    #[test]
    fn seeds_are_applied_and_bad_ones_skipped() {
        let mut cfg = config();
        cfg.initial_data = vec![
            seed("holding", 100, 2025),
            seed("input", 100, 5678),
            seed("coil", 0, 1),
            seed("discrete", 1, 3),
            seed("holding", 250, 1),
            seed("analog", 2, 2),
            seed("holding", 10, 777),
        ];
        let store = RegisterStore::new(&cfg).unwrap();

        assert_eq!(store.read_holding(1, 100, 1).unwrap(), vec![2025]);
        assert_eq!(store.read_input(1, 100, 1).unwrap(), vec![5678]);
        assert_eq!(store.read_coils(1, 0, 1).unwrap(), vec![true]);
        assert_eq!(store.read_discrete(1, 0, 2).unwrap(), vec![false, true]);
        assert_eq!(store.read_holding(1, 2, 1).unwrap(), vec![0]);
        // counter slot is reset after seeding
        assert_eq!(store.read_holding(1, 10, 1).unwrap(), vec![0]);
    }

    #[test]
    fn counter_outside_table_fails_construction() {
        let mut cfg = config();
        cfg.counter_address = 200;
        assert!(matches!(
            RegisterStore::new(&cfg),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn concurrent_writers_and_counter() {
        let store = Arc::new(store());

        thread::scope(|s| {
            for worker in 0..4u16 {
                let store = Arc::clone(&store);
                s.spawn(move || {
                    let base = 20 + worker * 10;
                    for round in 0..500u16 {
                        let values = [round; 10];
                        store.write_holding(1, base, &values).unwrap();
                        let read = store.read_holding(1, base, 10).unwrap();
                        assert!(read.iter().all(|v| *v == read[0]));
                    }
                });
            }
            let counter_store = Arc::clone(&store);
            s.spawn(move || {
                for _ in 0..1000 {
                    counter_store.increment_counter();
                }
            });
        });

        assert_eq!(store.counter_value(), 1000);
        assert_eq!(store.read_holding(1, 10, 1).unwrap(), vec![1000]);
        assert_eq!(store.snapshot_stats().requests_handled, 4 * 500 * 2 + 1);
    }
}
