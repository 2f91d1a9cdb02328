//! Device capability contracts.
//!
//! Plans address messages to devices, but preprocessors never depend on a
//! concrete device type. They only ask a device which capabilities it offers:
//!
//! - **Nameable**: every device has a stable display name
//! - **HasParent**: optional weak back-reference to an enclosing device
//! - **Stageable**: supports `stage`/`unstage`
//! - **Movable**: supports `set`
//! - **Readable**: supports `read`
//! - **Triggerable**: supports `trigger`
//! - **HasHints**: exposes visualization hints
//!
//! Capabilities are discovered through the `as_*` accessors, which return a
//! trait object when the device implements the capability and `None`
//! otherwise.

use anyhow::Result;
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Capability for devices that need preparation before use.
pub trait Stageable: Send + Sync {
    /// Prepare the device for acquisition.
    fn stage(&self) -> Result<()>;
    /// Undo `stage`.
    fn unstage(&self) -> Result<()>;
}

/// Capability for devices that can be driven to a setpoint.
pub trait Movable: Send + Sync {
    /// Drive to `value` and return once the move is accepted.
    fn set(&self, value: &Value) -> Result<()>;
}

/// Capability for devices that report a reading.
pub trait Readable: Send + Sync {
    /// Current reading, keyed however the device likes.
    fn read(&self) -> Result<Value>;
}

/// Capability for devices that acquire on demand.
pub trait Triggerable: Send + Sync {
    /// Start one acquisition.
    fn trigger(&self) -> Result<()>;
}

/// Capability for devices that suggest which fields to plot.
pub trait HasHints: Send + Sync {
    /// Field names worth plotting.
    fn hints(&self) -> Vec<String>;
}

/// A hardware-like resource that messages can target.
pub trait Device: Send + Sync {
    /// Stable display name.
    fn name(&self) -> &str;

    /// Enclosing device, if any.
    ///
    /// Implementations hold the parent as a `std::sync::Weak` and upgrade it
    /// here. A child never keeps its parent alive.
    fn parent(&self) -> Option<DeviceRef> {
        None
    }

    /// `Some` if the device supports `stage`/`unstage`.
    fn as_stageable(&self) -> Option<&dyn Stageable> {
        None
    }

    /// `Some` if the device supports `set`.
    fn as_movable(&self) -> Option<&dyn Movable> {
        None
    }

    /// `Some` if the device supports `read`.
    fn as_readable(&self) -> Option<&dyn Readable> {
        None
    }

    /// `Some` if the device supports `trigger`.
    fn as_triggerable(&self) -> Option<&dyn Triggerable> {
        None
    }

    /// `Some` if the device exposes plot hints.
    fn as_hinted(&self) -> Option<&dyn HasHints> {
        None
    }
}

/// Shared, identity-compared handle to a device.
///
/// Two handles are equal only when they point at the same device instance,
/// regardless of name.
#[derive(Clone)]
pub struct DeviceRef(Arc<dyn Device>);

impl DeviceRef {
    /// Wrap a freshly built device.
    pub fn new<D: Device + 'static>(device: D) -> Self {
        Self(Arc::new(device))
    }

    /// Wrap an already shared device.
    pub fn from_arc(device: Arc<dyn Device>) -> Self {
        Self(device)
    }

    /// Display name of the device.
    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// The underlying device, for capability lookups.
    pub fn device(&self) -> &dyn Device {
        self.0.as_ref()
    }

    /// Enclosing device, if it is still alive.
    pub fn parent(&self) -> Option<DeviceRef> {
        self.0.parent()
    }

    /// True if the device implements [`Stageable`].
    pub fn is_stageable(&self) -> bool {
        self.0.as_stageable().is_some()
    }

    /// True if the device implements [`Movable`].
    pub fn is_movable(&self) -> bool {
        self.0.as_movable().is_some()
    }

    /// Iterate the ancestor chain, starting with this device itself.
    pub fn ancestors(&self) -> Ancestors {
        Ancestors {
            next: Some(self.clone()),
        }
    }

    /// The outermost ancestor (the device itself when it has no parent).
    pub fn root_ancestor(&self) -> DeviceRef {
        self.ancestors().last().unwrap_or_else(|| self.clone())
    }

    /// True if `self` is `other` or one of `other`'s ancestors.
    pub fn contains(&self, other: &DeviceRef) -> bool {
        other.ancestors().any(|ancestor| ancestor == *self)
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for DeviceRef {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for DeviceRef {}

impl Hash for DeviceRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl fmt::Debug for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceRef({})", self.name())
    }
}

impl<D: Device + 'static> From<Arc<D>> for DeviceRef {
    fn from(device: Arc<D>) -> Self {
        Self(device)
    }
}

/// Iterator over a device and its ancestors, innermost first.
pub struct Ancestors {
    next: Option<DeviceRef>,
}

impl Iterator for Ancestors {
    type Item = DeviceRef;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = current.parent();
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;

    struct Node {
        name: String,
        parent: Option<Weak<Node>>,
    }

    impl Device for Node {
        fn name(&self) -> &str {
            &self.name
        }

        fn parent(&self) -> Option<DeviceRef> {
            self.parent
                .as_ref()
                .and_then(Weak::upgrade)
                .map(DeviceRef::from)
        }
    }

    fn node(name: &str, parent: Option<&Arc<Node>>) -> Arc<Node> {
        Arc::new(Node {
            name: name.to_string(),
            parent: parent.map(Arc::downgrade),
        })
    }

    #[test]
    fn test_identity_equality() {
        let a = DeviceRef::from(node("motor", None));
        let b = DeviceRef::from(node("motor", None));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_ancestor_chain() {
        let root = node("root", None);
        let mid = node("mid", Some(&root));
        let leaf = node("leaf", Some(&mid));

        let leaf = DeviceRef::from(leaf);
        let names: Vec<String> = leaf.ancestors().map(|d| d.name().to_string()).collect();
        assert_eq!(names, vec!["leaf", "mid", "root"]);
        assert_eq!(leaf.root_ancestor(), DeviceRef::from(root.clone()));
        assert!(DeviceRef::from(root).contains(&leaf));
        assert!(!leaf.contains(&DeviceRef::from(mid)));
    }

    #[test]
    fn test_parent_is_weak() {
        let root = node("root", None);
        let child = DeviceRef::from(node("child", Some(&root)));
        assert!(child.parent().is_some());
        drop(root);
        assert!(child.parent().is_none());
        assert_eq!(child.root_ancestor(), child);
    }

    #[test]
    fn test_default_capabilities() {
        let dev = DeviceRef::from(node("plain", None));
        assert!(!dev.is_stageable());
        assert!(!dev.is_movable());
        assert!(dev.device().as_hinted().is_none());
        assert!(dev.device().as_readable().is_none());
        assert!(dev.device().as_triggerable().is_none());
    }
}
