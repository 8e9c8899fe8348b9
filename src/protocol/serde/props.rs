//! The [`Props`] type, a key-value map that associates arbitrary metadata
//! with clients, streams and devices.

use std::ffi::{CStr, CString};

use enum_primitive_derive::Primitive;

use super::*;
use crate::protocol::ProtocolError;

/// Max. size of a property value in bytes.
const MAX_PROP_SIZE: u32 = 64 * 1024;

/// A list of key-value pairs that associate arbitrary properties with an
/// object. Keys are null-terminated strings and values are arbitrary binary
/// blobs, although by convention both are usually null-terminated ASCII
/// strings. Insertion order is preserved.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Props(Vec<(Box<CStr>, Box<[u8]>)>);

impl Props {
    /// Creates a new, empty property list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a well-known property, overwriting any existing value.
    pub fn set<T>(&mut self, prop: Prop, value: T)
    where
        T: AsRef<CStr>,
    {
        self.set_bytes(prop.to_c_str(), value.as_ref().to_bytes_with_nul());
    }

    /// Sets a well-known property to a UTF-8 string value.
    pub fn set_str(&mut self, prop: Prop, value: &str) {
        if let Ok(s) = CString::new(value) {
            self.set(prop, s);
        }
    }

    /// Sets a property, overwriting any existing value but keeping its
    /// position in the list.
    pub fn set_bytes<K, V>(&mut self, key: K, value: V)
    where
        K: AsRef<CStr>,
        V: AsRef<[u8]>,
    {
        let key = key.as_ref();
        match self.0.iter_mut().find(|(k, _)| k.as_ref() == key) {
            Some(entry) => entry.1 = value.as_ref().into(),
            None => self.0.push((key.into(), value.as_ref().into())),
        }
    }

    /// Gets the value of a well-known property, or `None` if unset.
    pub fn get(&self, prop: Prop) -> Option<&[u8]> {
        self.get_bytes(prop.to_c_str())
    }

    /// Gets a property from the map.
    pub fn get_bytes<K>(&self, key: K) -> Option<&[u8]>
    where
        K: AsRef<CStr>,
    {
        let key = key.as_ref();
        self.0
            .iter()
            .find(|(k, _)| k.as_ref() == key)
            .map(|(_, v)| &v[..])
    }

    /// Gets the value of a well-known property as a string, if it is one.
    pub fn get_str(&self, prop: Prop) -> Option<&str> {
        let v = self.get(prop)?;
        let v = v.strip_suffix(&[0]).unwrap_or(v);
        std::str::from_utf8(v).ok()
    }

    /// Removes a property, returning true if it was present.
    pub fn remove<K>(&mut self, key: K) -> bool
    where
        K: AsRef<CStr>,
    {
        let key = key.as_ref();
        let before = self.0.len();
        self.0.retain(|(k, _)| k.as_ref() != key);
        self.0.len() != before
    }

    /// Applies `other` to `self` according to `mode`.
    pub fn update(&mut self, mode: PropsUpdateMode, other: &Props) {
        match mode {
            PropsUpdateMode::Set => *self = other.clone(),
            PropsUpdateMode::Merge => {
                for (k, v) in other.iter() {
                    if self.get_bytes(k).is_none() {
                        self.set_bytes(k, v);
                    }
                }
            }
            PropsUpdateMode::Replace => {
                for (k, v) in other.iter() {
                    self.set_bytes(k, v);
                }
            }
        }
    }

    /// The number of properties in the list.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the properties, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&CStr, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_ref(), &v[..]))
    }
}

impl std::fmt::Debug for Props {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dm = f.debug_map();
        for (k, v) in self.iter() {
            match CStr::from_bytes_with_nul(v) {
                Ok(s) => dm.entry(&k, &s),
                Err(_) => dm.entry(&k, &"<bytes>"),
            };
        }

        dm.finish()
    }
}

/// Well-known property list keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[non_exhaustive]
pub enum Prop {
    /// For streams: localized media name, formatted as UTF-8.
    MediaName,
    /// For streams: logical role of this media, e.g. "music" or "event".
    MediaRole,
    /// For clients/streams: localized human readable application name.
    ApplicationName,
    /// For clients/streams: a textual id for identifying an application
    /// logically.
    ApplicationId,
    /// For clients/streams: a version string.
    ApplicationVersion,
    /// For clients/streams on UNIX: application process PID, an integer
    /// formatted as text.
    ApplicationProcessId,
    /// For clients/streams: application process name.
    ApplicationProcessBinary,
    /// For clients/streams: application user name.
    ApplicationProcessUser,
    /// For clients/streams: host name the application runs on.
    ApplicationProcessHost,
    /// For devices: localized human readable device one-line description.
    DeviceDescription,
    /// For devices: device string in the underlying audio layer's format.
    DeviceString,
    /// For devices: API this device is accessed with.
    DeviceApi,
    /// For devices: device class. One of "sound", "monitor", "filter".
    DeviceClass,
    /// For modules: a human readable one-line description of the module's
    /// purpose.
    ModuleDescription,
    /// For modules: a version string for the module.
    ModuleVersion,
}

impl Prop {
    /// Returns the property name to use in a property list.
    pub fn to_c_str(&self) -> &CStr {
        use self::Prop::*;

        match *self {
            MediaName => c"media.name",
            MediaRole => c"media.role",
            ApplicationName => c"application.name",
            ApplicationId => c"application.id",
            ApplicationVersion => c"application.version",
            ApplicationProcessId => c"application.process.id",
            ApplicationProcessBinary => c"application.process.binary",
            ApplicationProcessUser => c"application.process.user",
            ApplicationProcessHost => c"application.process.host",
            DeviceDescription => c"device.description",
            DeviceString => c"device.string",
            DeviceApi => c"device.api",
            DeviceClass => c"device.class",
            ModuleDescription => c"module.description",
            ModuleVersion => c"module.version",
        }
    }
}

impl TagStructRead for Props {
    fn read(ts: &mut TagStructReader<'_>, _protocol_version: u16) -> Result<Self, ProtocolError> {
        ts.expect_tag(Tag::PropList)?;

        let mut props = Props::new();
        while let Some(key) = ts.read_string()? {
            if key.to_bytes().is_empty() {
                return Err(ProtocolError::Invalid("proplist key is empty".into()));
            }

            let len = ts.read_u32()?;
            if len > MAX_PROP_SIZE {
                return Err(ProtocolError::Invalid(format!(
                    "proplist value size {} exceeds hard limit of {} bytes",
                    len, MAX_PROP_SIZE
                )));
            }

            let value = ts.read_arbitrary()?;
            if len != value.len() as u32 {
                return Err(ProtocolError::Invalid(format!(
                    "proplist expected value size {} does not match actual size {}",
                    len,
                    value.len()
                )));
            }

            props.set_bytes(key, value);
        }

        Ok(props)
    }
}

impl TagStructWrite for Props {
    fn write(
        &self,
        w: &mut TagStructWriter<'_>,
        _protocol_version: u16,
    ) -> Result<(), ProtocolError> {
        w.inner.write_u8(Tag::PropList as u8)?;

        for (k, v) in self.iter() {
            w.write_string(Some(k))?;
            w.write_u32(v.len() as u32)?;
            w.write_arbitrary(v)?;
        }

        w.write_null_string()?;
        Ok(())
    }
}

/// The mode of a [`Props`] update operation, used in various commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Primitive)]
pub enum PropsUpdateMode {
    /// Replace the entire property list with the new one.
    Set = 0,

    /// Merge the new property list into the current one without overwriting
    /// any existing values.
    Merge = 1,

    /// Merge the new property list into the current one, overwriting
    /// existing values.
    Replace = 2,
}

#[cfg(test)]
mod tests {
    use crate::protocol::{test_util::test_serde_version, MAX_VERSION};

    use super::*;

    #[test]
    fn props_serde() -> anyhow::Result<()> {
        let mut props = Props::new();
        props.set_bytes(CString::new("foo")?, [1, 2, 3]);
        props.set(Prop::ApplicationName, CString::new("bar")?);

        test_serde_version(&props, MAX_VERSION)?;
        Ok(())
    }

    #[test]
    fn insertion_order_is_preserved() -> anyhow::Result<()> {
        let mut props = Props::new();
        props.set_bytes(CString::new("zz")?, b"1");
        props.set_bytes(CString::new("aa")?, b"2");
        props.set_bytes(CString::new("zz")?, b"3");

        let keys: Vec<_> = props.iter().map(|(k, _)| k.to_owned()).collect();
        assert_eq!(keys, vec![CString::new("zz")?, CString::new("aa")?]);
        assert_eq!(props.get_bytes(CString::new("zz")?), Some(&b"3"[..]));

        Ok(())
    }

    #[test]
    fn update_modes() -> anyhow::Result<()> {
        let mut base = Props::new();
        base.set_str(Prop::ApplicationName, "old");
        base.set_str(Prop::MediaRole, "music");

        let mut update = Props::new();
        update.set_str(Prop::ApplicationName, "new");

        let mut merged = base.clone();
        merged.update(PropsUpdateMode::Merge, &update);
        assert_eq!(merged.get_str(Prop::ApplicationName), Some("old"));

        let mut replaced = base.clone();
        replaced.update(PropsUpdateMode::Replace, &update);
        assert_eq!(replaced.get_str(Prop::ApplicationName), Some("new"));
        assert_eq!(replaced.get_str(Prop::MediaRole), Some("music"));

        let mut set = base;
        set.update(PropsUpdateMode::Set, &update);
        assert_eq!(set.len(), 1);

        Ok(())
    }
}
