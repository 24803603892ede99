// ============================================================================
// CHANNEL HOST
// ============================================================================
// The server that answers client reads lives outside this crate; the bridge
// only needs to register slots, write them and read them back. `ChannelTree`
// is the in-process host used by the binary and by tests.
// ============================================================================

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{trace, warn};

use crate::error::ChannelError;
use crate::value::{RecordKind, TypedValue};
use crate::MAX_STRING_LENGTH;

/// Opaque reference to a registered slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotHandle(usize);

impl SlotHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Per-slot presentation options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotOptions {
    /// Human readable description, usually the raw appliance key
    pub doc: String,
    pub read_only: bool,
    /// Character cap for string-input slots
    pub max_length: Option<usize>,
    pub report_as_string: bool,
}

impl SlotOptions {
    pub fn for_kind(kind: RecordKind, doc: impl Into<String>) -> Self {
        let textual = kind.is_textual();
        Self {
            doc: doc.into(),
            read_only: false,
            max_length: textual.then_some(MAX_STRING_LENGTH),
            report_as_string: textual,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// What the bridge requires of the hosting channel server.
pub trait ChannelHost: Send + Sync + fmt::Debug {
    /// Create a channel. A name can only be registered once.
    fn register_slot(
        &self,
        name: &str,
        initial: TypedValue,
        kind: RecordKind,
        options: SlotOptions,
    ) -> Result<SlotHandle, ChannelError>;

    /// Store `value`, converted to the slot's kind, with `timestamp`.
    fn write(&self, handle: SlotHandle, value: TypedValue, timestamp: DateTime<Utc>) -> Result<(), ChannelError>;

    fn read(&self, handle: SlotHandle) -> Result<(TypedValue, DateTime<Utc>), ChannelError>;
}

#[derive(Debug, Clone)]
struct ChannelEntry {
    name: String,
    kind: RecordKind,
    options: SlotOptions,
    value: TypedValue,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TreeInner {
    entries: Vec<ChannelEntry>,
    by_name: HashMap<String, SlotHandle>,
}

/// In-process channel host.
#[derive(Debug, Default)]
pub struct ChannelTree {
    inner: RwLock<TreeInner>,
}

impl ChannelTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, name: &str) -> Option<SlotHandle> {
        self.inner.read().by_name.get(name).copied()
    }

    /// Current value of the channel called `name`.
    pub fn value_of(&self, name: &str) -> Option<TypedValue> {
        let inner = self.inner.read();
        let handle = inner.by_name.get(name)?;
        inner.entries.get(handle.0).map(|entry| entry.value.clone())
    }

    pub fn kind_of(&self, name: &str) -> Option<RecordKind> {
        let inner = self.inner.read();
        let handle = inner.by_name.get(name)?;
        inner.entries.get(handle.0).map(|entry| entry.kind)
    }

    pub fn options_of(&self, name: &str) -> Option<SlotOptions> {
        let inner = self.inner.read();
        let handle = inner.by_name.get(name)?;
        inner.entries.get(handle.0).map(|entry| entry.options.clone())
    }

    /// Sorted channel names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().by_name.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChannelHost for ChannelTree {
    fn register_slot(
        &self,
        name: &str,
        initial: TypedValue,
        kind: RecordKind,
        options: SlotOptions,
    ) -> Result<SlotHandle, ChannelError> {
        let mut inner = self.inner.write();
        if inner.by_name.contains_key(name) {
            warn!(target: "archstats::channel", channel = %name, kind = %kind, "Channel already registered");
            return Err(ChannelError::AlreadyRegistered {
                channel: name.to_string(),
            });
        }

        let value = initial.convert_to(kind).unwrap_or(initial);
        let handle = SlotHandle(inner.entries.len());
        inner.entries.push(ChannelEntry {
            name: name.to_string(),
            kind,
            options,
            value,
            timestamp: Utc::now(),
        });
        inner.by_name.insert(name.to_string(), handle);
        trace!(target: "archstats::channel", channel = %name, kind = %kind, "Registered channel");
        Ok(handle)
    }

    fn write(&self, handle: SlotHandle, value: TypedValue, timestamp: DateTime<Utc>) -> Result<(), ChannelError> {
        let mut inner = self.inner.write();
        let entry = inner
            .entries
            .get_mut(handle.0)
            .ok_or(ChannelError::UnknownHandle { handle: handle.0 })?;

        let converted = value.convert_to(entry.kind).ok_or_else(|| ChannelError::TypeMismatch {
            channel: entry.name.clone(),
            expected: entry.kind.as_str(),
            got: value.to_string(),
        })?;
        entry.value = converted;
        entry.timestamp = timestamp;
        Ok(())
    }

    fn read(&self, handle: SlotHandle) -> Result<(TypedValue, DateTime<Utc>), ChannelError> {
        let inner = self.inner.read();
        inner
            .entries
            .get(handle.0)
            .map(|entry| (entry.value.clone(), entry.timestamp))
            .ok_or(ChannelError::UnknownHandle { handle: handle.0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_register_write_read() {
        let tree = ChannelTree::new();
        let handle = tree.register_slot(
            "ARCH:a0:PvCount",
            TypedValue::Int(1),
            RecordKind::LongInput,
            SlotOptions::for_kind(RecordKind::LongInput, "pvCount"),
        )
        .unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        tree.write(handle, TypedValue::Int(2), at).unwrap();

        assert_eq!(tree.read(handle).unwrap(), (TypedValue::Int(2), at));
        assert_eq!(tree.value_of("ARCH:a0:PvCount"), Some(TypedValue::Int(2)));
        assert_eq!(tree.lookup("ARCH:a0:PvCount"), Some(handle));
    }

    #[test]
    fn test_write_converts_to_fixed_kind() {
        let tree = ChannelTree::new();
        let handle = tree
            .register_slot("x", TypedValue::Float(1.0), RecordKind::AnalogInput, SlotOptions::default())
            .unwrap();
        tree.write(handle, TypedValue::Int(3), Utc::now()).unwrap();
        assert_eq!(tree.value_of("x"), Some(TypedValue::Float(3.0)));

        let err = tree
            .write(handle, TypedValue::Text("busy".into()), Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            ChannelError::TypeMismatch {
                channel: "x".into(),
                expected: "ai",
                got: "busy".into()
            }
        );
        assert_eq!(tree.kind_of("x"), Some(RecordKind::AnalogInput));
    }

    #[test]
    fn test_unknown_handle() {
        let tree = ChannelTree::new();
        assert_eq!(
            tree.read(SlotHandle(7)).unwrap_err(),
            ChannelError::UnknownHandle { handle: 7 }
        );
    }

    #[test]
    fn test_duplicate_name_keeps_first_owner() {
        let tree = ChannelTree::new();
        let first = tree
            .register_slot("dup", TypedValue::Int(1), RecordKind::LongInput, SlotOptions::default())
            .unwrap();
        let second = tree.register_slot(
            "dup",
            TypedValue::Text("s".into()),
            RecordKind::StringInput,
            SlotOptions::for_kind(RecordKind::StringInput, "dup"),
        );

        assert_eq!(second, Err(ChannelError::AlreadyRegistered { channel: "dup".into() }));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.kind_of("dup"), Some(RecordKind::LongInput));
        assert_eq!(tree.read(first).unwrap().0, TypedValue::Int(1));
    }
}
