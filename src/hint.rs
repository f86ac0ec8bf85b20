//! Hint Registry: named per-communicator tuning flags.
//!
//! The registry is a fixed table of [`HINT_MAX`] descriptors addressed by a
//! small integer id. Every communicator carries one value slot per id, read
//! without synchronization on hot paths through [`Comm::hint`].
//!
//! Setting a hint goes through the registry: if the hint has a validator, the
//! validator alone checks the value, applies any side effect and writes the
//! slot (with [`Comm::store_hint`]); otherwise the raw value is written.
//!
//! Hints not marked [`HintAttr::Local`] must hold the same value on every rank
//! of a communicator. After hints are applied (at commit and by
//! [`Comm::set_info`]) the values are exchanged with an allgather over the
//! communicator and any difference fails with [`Error::HintMismatch`].
//!
//! Registering an id again with the same name, type and attribute is
//! accepted and keeps the first registration; any conflicting registration is
//! rejected.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::comm::Comm;
use crate::config::parse_bool;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::info::Info;

/// Number of hint slots.
pub const HINT_MAX: usize = 100;

/// Index of a hint in the registry.
pub type HintId = usize;

/// Ids of the hints registered at initialization.
pub mod predefined {
    use super::HintId;

    /// The application never receives with a wildcard tag
    pub const NO_ANY_TAG: HintId = 1;
    /// The application never receives from a wildcard source
    pub const NO_ANY_SOURCE: HintId = 2;
    /// Receive buffers always match the incoming message length
    pub const EXACT_LENGTH: HintId = 3;
    /// Messages may overtake each other
    pub const ALLOW_OVERTAKING: HintId = 4;
    /// Eager/rendezvous protocol switch point in bytes
    pub const EAGER_THRESHOLD: HintId = 5;
    /// Operations may return "try again" instead of blocking
    pub const EAGAIN: HintId = 6;
    /// Stripe large messages over several NICs
    pub const MULTI_NIC_STRIPING: HintId = 7;
    /// Hash messages over several NICs
    pub const MULTI_NIC_HASHING: HintId = 8;
    /// Preferred NIC index (may differ per rank)
    pub const MULTI_NIC_PREF_NIC: HintId = 9;
    /// VCI used for sending (may differ per rank)
    pub const SENDER_VCI: HintId = 10;
    /// VCI used for receiving (may differ per rank)
    pub const RECEIVER_VCI: HintId = 11;
    /// First id handed out by dynamic registration
    pub const FIRST_DYNAMIC: HintId = 12;
}

/// Value type of a hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintType {
    /// `true`/`false` (stored as 1/0)
    Bool,
    /// 32-bit integer
    Int,
}

/// Consistency requirement of a hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintAttr {
    /// Must be identical on every rank
    Global,
    /// May differ per rank
    Local,
}

/// Validator callback: checks `value`, applies side effects, writes the slot.
pub type HintValidator = Arc<dyn Fn(&Comm, HintId, i32) -> Result<()> + Send + Sync>;

/// A registered hint.
#[derive(Clone)]
pub struct HintDescriptor {
    name: String,
    validator: Option<HintValidator>,
    ty: HintType,
    attr: HintAttr,
    default: i32,
}

impl fmt::Debug for HintDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HintDescriptor")
            .field("name", &self.name)
            .field("validator", &self.validator.is_some())
            .field("ty", &self.ty)
            .field("attr", &self.attr)
            .field("default", &self.default)
            .finish()
    }
}

impl HintDescriptor {
    /// Info key of the hint.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value type.
    pub fn ty(&self) -> HintType {
        self.ty
    }

    /// Consistency requirement.
    pub fn attr(&self) -> HintAttr {
        self.attr
    }

    /// Value of the slot on a new communicator.
    pub fn default_value(&self) -> i32 {
        self.default
    }

    /// Whether a validator is installed.
    pub fn has_validator(&self) -> bool {
        self.validator.is_some()
    }

    fn parse(&self, text: &str) -> Result<i32> {
        match self.ty {
            HintType::Bool => parse_bool(text).map(i32::from),
            HintType::Int => text.trim().parse().ok(),
        }
        .ok_or_else(|| {
            Error::InvalidHint(format!("'{text}' is not a valid value for {}", self.name))
        })
    }

    fn format(&self, value: i32) -> String {
        match self.ty {
            HintType::Bool => (value != 0).to_string(),
            HintType::Int => value.to_string(),
        }
    }

    fn same_shape(&self, other: &HintDescriptor) -> bool {
        self.name == other.name && self.ty == other.ty && self.attr == other.attr
    }
}

/// Per-communicator hint values.
#[derive(Debug)]
pub(crate) struct HintValues([AtomicI32; HINT_MAX]);

impl HintValues {
    pub(crate) fn from_array(values: [i32; HINT_MAX]) -> Self {
        HintValues(values.map(AtomicI32::new))
    }

    #[inline]
    pub(crate) fn get(&self, id: HintId) -> i32 {
        self.0.get(id).map_or(0, |v| v.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set(&self, id: HintId, value: i32) {
        if let Some(slot) = self.0.get(id) {
            slot.store(value, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> [i32; HINT_MAX] {
        std::array::from_fn(|i| self.get(i))
    }
}

/// The process-wide hint table.
pub struct HintRegistry {
    entries: RwLock<Vec<Option<HintDescriptor>>>,
}

impl fmt::Debug for HintRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered = self.entries.read().iter().flatten().count();
        f.debug_struct("HintRegistry")
            .field("registered", &registered)
            .finish()
    }
}

impl HintRegistry {
    /// A registry holding the predefined hints.
    pub(crate) fn with_predefined() -> Self {
        use predefined::*;
        let registry = HintRegistry {
            entries: RwLock::new(vec![None; HINT_MAX]),
        };
        let table: [(HintId, &str, HintType, HintAttr, i32); 11] = [
            (NO_ANY_TAG, "mpi_assert_no_any_tag", HintType::Bool, HintAttr::Global, 0),
            (NO_ANY_SOURCE, "mpi_assert_no_any_source", HintType::Bool, HintAttr::Global, 0),
            (EXACT_LENGTH, "mpi_assert_exact_length", HintType::Bool, HintAttr::Global, 0),
            (ALLOW_OVERTAKING, "mpi_assert_allow_overtaking", HintType::Bool, HintAttr::Global, 0),
            (EAGER_THRESHOLD, "eager_threshold", HintType::Int, HintAttr::Global, -1),
            (EAGAIN, "eagain", HintType::Bool, HintAttr::Global, 0),
            (MULTI_NIC_STRIPING, "enable_multi_nic_striping", HintType::Bool, HintAttr::Global, 0),
            (MULTI_NIC_HASHING, "enable_multi_nic_hashing", HintType::Bool, HintAttr::Global, 0),
            (MULTI_NIC_PREF_NIC, "multi_nic_pref_nic", HintType::Int, HintAttr::Local, -1),
            (SENDER_VCI, "sender_vci", HintType::Int, HintAttr::Local, -1),
            (RECEIVER_VCI, "receiver_vci", HintType::Int, HintAttr::Local, -1),
        ];
        {
            let mut entries = registry.entries.write();
            for (id, name, ty, attr, default) in table {
                entries[id] = Some(HintDescriptor {
                    name: name.to_string(),
                    validator: None,
                    ty,
                    attr,
                    default,
                });
            }
        }
        registry
    }

    /// Install a hint.
    ///
    /// With `id == None` the first free slot at or above
    /// [`predefined::FIRST_DYNAMIC`] is used. Returns the id.
    pub fn register(
        &self,
        id: Option<HintId>,
        name: &str,
        validator: Option<HintValidator>,
        ty: HintType,
        attr: HintAttr,
        default: i32,
    ) -> Result<HintId> {
        if name.is_empty() {
            return Err(Error::HintRegistration("empty hint name".into()));
        }
        let desc = HintDescriptor {
            name: name.to_string(),
            validator,
            ty,
            attr,
            default,
        };

        let mut entries = self.entries.write();
        if let Some(existing) = entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.name == name))
        {
            let matches_slot = id.map_or(true, |id| id == existing);
            let same = entries[existing]
                .as_ref()
                .is_some_and(|e| e.same_shape(&desc));
            if matches_slot && same {
                tracing::debug!(name, id = existing, "hint already registered");
                return Ok(existing);
            }
            return Err(Error::HintRegistration(format!(
                "'{name}' already registered with id {existing}"
            )));
        }

        let id = match id {
            Some(id) if id == 0 || id >= HINT_MAX => {
                return Err(Error::HintRegistration(format!("hint id {id} out of range")));
            }
            Some(id) => {
                if let Some(other) = &entries[id] {
                    return Err(Error::HintRegistration(format!(
                        "hint id {id} already used by '{}'",
                        other.name
                    )));
                }
                id
            }
            None => (predefined::FIRST_DYNAMIC..HINT_MAX)
                .find(|&i| entries[i].is_none())
                .ok_or_else(|| Error::HintRegistration("hint table full".into()))?,
        };
        entries[id] = Some(desc);
        tracing::debug!(name, id, "hint registered");
        Ok(id)
    }

    /// Descriptor registered under `id`.
    pub fn descriptor(&self, id: HintId) -> Option<HintDescriptor> {
        self.entries.read().get(id).cloned().flatten()
    }

    /// Id and descriptor registered under `name`.
    pub fn lookup(&self, name: &str) -> Option<(HintId, HintDescriptor)> {
        self.entries
            .read()
            .iter()
            .enumerate()
            .find_map(|(i, e)| e.as_ref().filter(|e| e.name == name).map(|e| (i, e.clone())))
    }

    /// Slot values of a new communicator.
    pub(crate) fn defaults(&self) -> [i32; HINT_MAX] {
        let entries = self.entries.read();
        std::array::from_fn(|i| entries[i].as_ref().map_or(0, |e| e.default))
    }

    /// Set hint `id` on `comm` through its validator, or write it raw.
    pub(crate) fn set(&self, comm: &Comm, id: HintId, value: i32) -> Result<()> {
        let desc = self
            .descriptor(id)
            .ok_or_else(|| Error::InvalidHint(format!("no hint registered with id {id}")))?;
        match &desc.validator {
            Some(validate) => validate(comm, id, value),
            None => {
                comm.store_hint(id, value);
                Ok(())
            }
        }
    }

    /// Apply every registered hint named in `info`. Unknown keys are ignored.
    pub(crate) fn apply_info(&self, comm: &Comm, info: &Info) -> Result<()> {
        for (key, value) in info.iter() {
            let Some((id, desc)) = self.lookup(key) else {
                continue;
            };
            let parsed = desc.parse(value)?;
            self.set(comm, id, parsed)?;
        }
        Ok(())
    }

    /// Current values of every registered hint on `comm`, as info.
    pub(crate) fn info_of(&self, comm: &Comm) -> Result<Info> {
        let entries = self.entries.read().clone();
        let mut info = Info::new();
        for (id, desc) in entries.iter().enumerate() {
            if let Some(desc) = desc {
                info.set(&desc.name, &desc.format(comm.hint(id)))?;
            }
        }
        Ok(info)
    }

    /// Verify that every non-local hint has the same value on every rank.
    ///
    /// Collective over `comm`. On an intercommunicator a second exchange
    /// hands each side back the values the remote group gathered from it, so
    /// both groups judge the same set of values.
    pub(crate) fn check(&self, comm: &Comm, device: &dyn Device) -> Result<()> {
        let global: Vec<(HintId, String)> = self
            .entries
            .read()
            .iter()
            .enumerate()
            .filter_map(|(i, e)| {
                e.as_ref()
                    .filter(|e| e.attr == HintAttr::Global)
                    .map(|e| (i, e.name.clone()))
            })
            .collect();
        if global.is_empty() {
            return Ok(());
        }

        let mine: Vec<i64> = global.iter().map(|(id, _)| i64::from(comm.hint(*id))).collect();
        let scope = comm.scope();
        let mut gathered = device.allgather(&scope, &mine)?;
        if gathered.len() != mine.len() * scope.gather_size() {
            return Err(Error::Internal(format!(
                "hint exchange returned {} values for {} hints",
                gathered.len(),
                mine.len()
            )));
        }
        if comm.is_intercomm() {
            let local = device.allgather(&scope, &gathered)?;
            if local.is_empty() || local.len() % mine.len() != 0 {
                return Err(Error::Internal(format!(
                    "hint exchange returned {} local values for {} hints",
                    local.len(),
                    mine.len()
                )));
            }
            gathered.extend(local);
        }

        for (slot, (_, name)) in global.iter().enumerate() {
            let mut values: Vec<i32> = gathered
                .chunks(mine.len())
                .map(|c| c[slot] as i32)
                .collect();
            values.sort_unstable();
            values.dedup();
            if values.len() > 1 {
                tracing::warn!(hint = %name, ?values, "hint differs across ranks");
                return Err(Error::HintMismatch {
                    hint: name.clone(),
                    values,
                });
            }
        }
        Ok(())
    }
}

impl Comm {
    /// Set hint `id` to `value` on this rank.
    ///
    /// Does not check cross-rank consistency; see [`check_hints`](Self::check_hints).
    pub fn set_hint(&self, id: HintId, value: i32) -> Result<()> {
        self.ensure_usable()?;
        let shared = self.shared()?;
        let _cs = shared.global_cs.lock();
        self.with_state_locked(|| shared.hints.set(self, id, value))
    }

    /// Apply the registered hints named in `info`, then verify that non-local
    /// hints agree across the communicator. Collective.
    pub fn set_info(&self, info: &Info) -> Result<()> {
        self.ensure_usable()?;
        let shared = self.shared()?;
        {
            let _cs = shared.global_cs.lock();
            self.with_state_locked(|| shared.hints.apply_info(self, info))?;
        }
        shared.hints.check(self, shared.device.as_ref())
    }

    /// Current values of every registered hint.
    pub fn get_info(&self) -> Result<Info> {
        let shared = self.shared()?;
        shared.hints.info_of(self)
    }

    /// Verify that non-local hints agree across the communicator. Collective.
    pub fn check_hints(&self) -> Result<()> {
        let shared = self.shared()?;
        shared.hints.check(self, shared.device.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::loopback::LoopbackFabric;
    use crate::{Runtime, RuntimeConfig, ThreadLevel};

    fn single() -> Runtime {
        let fabric = LoopbackFabric::single_node(1);
        Runtime::init_thread(
            ThreadLevel::Multiple,
            RuntimeConfig::default(),
            fabric.device(0),
            fabric.topology(0),
        )
        .unwrap()
    }

    #[test]
    fn predefined_hints_are_registered() {
        let registry = HintRegistry::with_predefined();
        let (id, desc) = registry.lookup("mpi_assert_no_any_tag").unwrap();
        assert_eq!(id, predefined::NO_ANY_TAG);
        assert_eq!(desc.ty(), HintType::Bool);
        assert_eq!(registry.lookup("sender_vci").unwrap().1.attr(), HintAttr::Local);
        assert_eq!(registry.defaults()[predefined::EAGER_THRESHOLD], -1);
    }

    #[test]
    fn dynamic_registration_and_conflicts() {
        let registry = HintRegistry::with_predefined();
        let id = registry
            .register(None, "my_flag", None, HintType::Bool, HintAttr::Global, 0)
            .unwrap();
        assert_eq!(id, predefined::FIRST_DYNAMIC);

        // identical re-registration keeps the first id
        let again = registry
            .register(None, "my_flag", None, HintType::Bool, HintAttr::Global, 0)
            .unwrap();
        assert_eq!(again, id);

        // same name, different type
        assert!(registry
            .register(None, "my_flag", None, HintType::Int, HintAttr::Global, 0)
            .is_err());
        // occupied slot
        assert!(registry
            .register(Some(id), "other", None, HintType::Int, HintAttr::Global, 0)
            .is_err());
        assert!(registry
            .register(Some(HINT_MAX), "far", None, HintType::Int, HintAttr::Global, 0)
            .is_err());
    }

    #[test]
    fn raw_hint_write_is_read_back_without_side_effects() {
        let rt = single();
        let id = rt
            .register_hint(None, "batch", None, HintType::Int, HintAttr::Local, 4)
            .unwrap();
        let comm = rt.world().dup(None).unwrap();
        assert_eq!(comm.hint(id), 4);
        comm.set_hint(id, 17).unwrap();
        assert_eq!(comm.hint(id), 17);
        assert_eq!(rt.world().hint(id), 4);
        comm.release().unwrap();
    }

    #[test]
    fn validator_owns_the_slot() {
        let rt = single();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let validator: HintValidator = Arc::new(move |comm, id, value| {
            seen.fetch_add(1, Ordering::SeqCst);
            if value < 0 {
                return Err(Error::InvalidHint("negative".into()));
            }
            comm.store_hint(id, value * 2);
            Ok(())
        });
        let id = rt
            .register_hint(None, "doubled", Some(validator), HintType::Int, HintAttr::Global, 0)
            .unwrap();
        let comm = rt.world().dup(None).unwrap();
        comm.set_hint(id, 5).unwrap();
        assert_eq!(comm.hint(id), 10);
        assert!(comm.set_hint(id, -1).is_err());
        assert_eq!(comm.hint(id), 10);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        comm.release().unwrap();
    }

    #[test]
    fn info_round_trip_through_dup() {
        let rt = single();
        let mut info = Info::new();
        info.set("mpi_assert_no_any_tag", "true").unwrap();
        info.set("eager_threshold", "4096").unwrap();
        info.set("unknown_key", "ignored").unwrap();
        let comm = rt.world().dup(Some(&info)).unwrap();
        assert_eq!(comm.hint(predefined::NO_ANY_TAG), 1);
        assert_eq!(comm.hint(predefined::EAGER_THRESHOLD), 4096);

        let out = comm.get_info().unwrap();
        assert_eq!(out.get("mpi_assert_no_any_tag"), Some("true"));
        assert_eq!(out.get("eager_threshold"), Some("4096"));
        assert_eq!(out.get("unknown_key"), None);

        let child = comm.dup(None).unwrap();
        assert_eq!(child.hint(predefined::EAGER_THRESHOLD), 4096);
        child.release().unwrap();
        comm.release().unwrap();
    }

    #[test]
    fn bad_hint_value_fails_commit_cleanly() {
        let rt = single();
        let before = rt.live_comms();
        let mut info = Info::new();
        info.set("eager_threshold", "lots").unwrap();
        assert!(matches!(rt.world().dup(Some(&info)), Err(Error::InvalidHint(_))));
        assert_eq!(rt.live_comms(), before);
    }
}
