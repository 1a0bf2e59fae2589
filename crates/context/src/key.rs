use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

/// A value stored in a registry.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Identity-compared registry key.
///
/// Two keys are equal only if one is a clone of the other; the name is for
/// diagnostics. Cloning is a reference-count bump.
#[derive(Clone)]
pub struct ContextKey {
	inner: Arc<KeyInner>,
}

struct KeyInner {
	name: Cow<'static, str>,
}

impl ContextKey {
	pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
		Self {
			inner: Arc::new(KeyInner { name: name.into() }),
		}
	}

	pub fn name(&self) -> &str {
		&self.inner.name
	}

	#[inline]
	fn addr(&self) -> usize {
		Arc::as_ptr(&self.inner) as usize
	}
}

impl PartialEq for ContextKey {
	#[inline]
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.inner, &other.inner)
	}
}

impl Eq for ContextKey {}

impl Hash for ContextKey {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.addr().hash(state);
	}
}

impl fmt::Debug for ContextKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ContextKey({:?}@{:#x})", self.inner.name, self.addr())
	}
}

impl fmt::Display for ContextKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.inner.name)
	}
}

/// A [`ContextKey`] whose values are known to be `T`.
pub struct TypedKey<T> {
	key: ContextKey,
	_marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> TypedKey<T> {
	pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
		Self {
			key: ContextKey::new(name),
			_marker: PhantomData,
		}
	}

	/// Returns the untyped key.
	pub fn raw(&self) -> &ContextKey {
		&self.key
	}
}

impl<T> Clone for TypedKey<T> {
	fn clone(&self) -> Self {
		Self {
			key: self.key.clone(),
			_marker: PhantomData,
		}
	}
}

impl<T> fmt::Debug for TypedKey<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_tuple("TypedKey").field(&self.key).finish()
	}
}
