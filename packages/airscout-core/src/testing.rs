//! Scriptable probe for unit tests.

use crate::device::{CapabilitySet, DeviceCategory, DeviceDraft, DeviceRecord, DeviceStatus};
use crate::error::{ManagementError, NormalizationError, ProbeError};
use crate::manager::ManagementAction;
use crate::probe::{PlatformProbe, ProbeDescriptor, RawRecord};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Raw record from `key=value` pairs.
pub fn raw(pairs: &[(&str, &str)]) -> RawRecord {
    pairs
        .iter()
        .fold(RawRecord::new(), |record, (k, v)| record.with(k, *v))
}

/// A probe whose listing, failures, latency and management results are set
/// by the test.
///
/// Normalization reads `name`, `address`, `category`, `status`, `vendor_id`,
/// `product_id`, `vendor` and `manage=yes`; a record with a `malformed` key
/// fails to normalize.
pub struct FakeProbe {
    descriptor: ProbeDescriptor,
    available: AtomicBool,
    records: Mutex<Vec<RawRecord>>,
    list_error: Mutex<Option<ProbeError>>,
    list_delay: Mutex<Duration>,
    apply_delay: Mutex<Duration>,
    apply_result: Mutex<Result<(), ManagementError>>,
    list_calls: AtomicUsize,
    apply_calls: AtomicUsize,
}

impl FakeProbe {
    pub fn new(name: &'static str, priority: u8, categories: &[DeviceCategory]) -> Self {
        Self {
            descriptor: ProbeDescriptor {
                name,
                categories: categories.to_vec(),
                priority,
            },
            available: AtomicBool::new(true),
            records: Mutex::new(Vec::new()),
            list_error: Mutex::new(None),
            list_delay: Mutex::new(Duration::ZERO),
            apply_delay: Mutex::new(Duration::ZERO),
            apply_result: Mutex::new(Ok(())),
            list_calls: AtomicUsize::new(0),
            apply_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_records(self, records: Vec<RawRecord>) -> Self {
        self.set_records(records);
        self
    }

    pub fn unavailable(self) -> Self {
        self.available.store(false, Ordering::SeqCst);
        self
    }

    pub fn with_list_delay(self, delay: Duration) -> Self {
        *self.list_delay.lock().unwrap() = delay;
        self
    }

    pub fn with_apply_delay(self, delay: Duration) -> Self {
        *self.apply_delay.lock().unwrap() = delay;
        self
    }

    pub fn with_apply_result(self, result: Result<(), ManagementError>) -> Self {
        *self.apply_result.lock().unwrap() = result;
        self
    }

    pub fn set_records(&self, records: Vec<RawRecord>) {
        *self.records.lock().unwrap() = records;
    }

    pub fn fail_with(&self, error: Option<ProbeError>) {
        *self.list_error.lock().unwrap() = error;
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }
}

impl PlatformProbe for FakeProbe {
    fn descriptor(&self) -> &ProbeDescriptor {
        &self.descriptor
    }

    fn availability(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn list(&self) -> Result<Vec<RawRecord>, ProbeError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.list_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if let Some(error) = self.list_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self.records.lock().unwrap().clone())
    }

    fn normalize(&self, raw: &RawRecord) -> Result<DeviceDraft, NormalizationError> {
        if raw.get("malformed").is_some() {
            return Err(NormalizationError::new(self.descriptor.name, "malformed test record"));
        }

        let category = raw
            .get("category")
            .and_then(|c| c.parse().ok())
            .unwrap_or(DeviceCategory::Other);
        let mut draft = DeviceDraft::new(category, raw.get("name").unwrap_or_default())
            .ids(
                raw.get("vendor_id").map(str::to_string),
                raw.get("product_id").map(str::to_string),
            )
            .status(
                raw.get("status")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DeviceStatus::Unknown),
            );
        if let Some(address) = raw.get("address") {
            draft = draft.address(address);
        }
        if let Some(vendor) = raw.get("vendor") {
            draft = draft.vendor_name(vendor);
        }
        if raw.get("manage") == Some("yes") {
            draft = draft.capabilities(CapabilitySet::toggle());
        }
        Ok(draft)
    }

    fn apply(&self, _record: &DeviceRecord, _action: ManagementAction) -> Result<(), ManagementError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.apply_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.apply_result.lock().unwrap().clone()
    }
}
