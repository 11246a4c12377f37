//! # Erased Values
//!
//! The interpreter moves values between instructions without knowing their
//! static types. Every success value, typed failure, environment and
//! fiber-ref slot travels as a [`Dynamic`]: a cloneable, thread-safe box
//! around `dyn Any`.
//!
//! Typed front-ends (`Effect<R, E, A>`, `FiberHandle<E, A>`, `FiberRef<A>`)
//! put values in with [`Dynamic::new`] and take them back out with
//! [`Dynamic::take`]. The type parameters on those front-ends guarantee that
//! the two always agree, so a mismatch is a runtime bug and panics.

use std::any::{type_name, Any, TypeId};
use std::fmt;

/// Bound shared by every value an effect can produce, fail with, or read
/// from its environment.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Value for T {}

/// Object-safe view of a [`Value`].
trait AnyValue: Any + Send + Sync {
    fn clone_value(&self) -> Box<dyn AnyValue>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
    fn type_name(&self) -> &'static str;
}

impl<T: Value> AnyValue for T {
    fn clone_value(&self) -> Box<dyn AnyValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

/// A type-erased, cloneable value.
pub struct Dynamic(Box<dyn AnyValue>);

impl Dynamic {
    /// Erase a value. Erasing a `Dynamic` returns it unchanged.
    pub fn new<T: Value>(value: T) -> Self {
        let boxed: Box<dyn Any> = Box::new(value);
        match boxed.downcast::<Dynamic>() {
            Ok(dynamic) => *dynamic,
            Err(boxed) => match boxed.downcast::<T>() {
                Ok(value) => Self(value),
                Err(_) => unreachable!("boxed value has type T"),
            },
        }
    }

    /// The unit value.
    pub fn unit() -> Self {
        Self::new(())
    }

    /// Check whether the erased value has type `T`.
    pub fn is<T: Value>(&self) -> bool {
        is_dynamic::<T>() || (*self.0).as_any().is::<T>()
    }

    /// Borrow the value as `T`, if it has that type.
    pub fn downcast_ref<T: Value>(&self) -> Option<&T> {
        if is_dynamic::<T>() {
            return (self as &dyn Any).downcast_ref::<T>();
        }
        (*self.0).as_any().downcast_ref::<T>()
    }

    /// Recover the value as `T`, handing the box back on mismatch.
    pub fn downcast<T: Value>(self) -> Result<T, Dynamic> {
        if is_dynamic::<T>() {
            let boxed: Box<dyn Any> = Box::new(self);
            return match boxed.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(_) => unreachable!("T is Dynamic"),
            };
        }
        if !self.is::<T>() {
            return Err(self);
        }
        match self.0.into_any().downcast::<T>() {
            Ok(value) => Ok(*value),
            Err(_) => unreachable!("type checked above"),
        }
    }

    /// Recover the value as `T`.
    ///
    /// # Panics
    /// Panics if the erased value is not a `T`. Typed front-ends never let
    /// this happen.
    pub fn take<T: Value>(self) -> T {
        self.downcast::<T>().unwrap_or_else(|other| {
            panic!(
                "effect value type mismatch: expected {}, found {}",
                type_name::<T>(),
                other.type_name()
            )
        })
    }

    /// Name of the erased type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        (*self.0).type_name()
    }
}

fn is_dynamic<T: 'static>() -> bool {
    TypeId::of::<T>() == TypeId::of::<Dynamic>()
}

impl Clone for Dynamic {
    fn clone(&self) -> Self {
        Self((*self.0).clone_value())
    }
}

impl fmt::Debug for Dynamic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.downcast_ref::<String>() {
            return write!(f, "{s:?}");
        }
        if let Some(s) = self.downcast_ref::<&'static str>() {
            return write!(f, "{s:?}");
        }
        if let Some(n) = self.downcast_ref::<i32>() {
            return write!(f, "{n}");
        }
        if let Some(n) = self.downcast_ref::<i64>() {
            return write!(f, "{n}");
        }
        if let Some(n) = self.downcast_ref::<u64>() {
            return write!(f, "{n}");
        }
        write!(f, "<{}>", self.type_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let value = Dynamic::new(42i32);
        assert!(value.is::<i32>());
        assert!(!value.is::<u32>());
        assert_eq!(value.take::<i32>(), 42);
    }

    #[test]
    fn test_clone_is_deep() {
        let original = Dynamic::new(vec![1, 2, 3]);
        let copy = original.clone();
        assert_eq!(original.take::<Vec<i32>>(), copy.take::<Vec<i32>>());
    }

    #[test]
    fn test_downcast_mismatch_returns_box() {
        let value = Dynamic::new("hello".to_string());
        let back = value.downcast::<i64>().unwrap_err();
        assert_eq!(back.downcast_ref::<String>().map(String::as_str), Some("hello"));
    }

    #[test]
    fn test_dynamic_is_not_rewrapped() {
        let nested = Dynamic::new(Dynamic::new(3u64));
        assert!(nested.is::<u64>());
        let same = nested.take::<Dynamic>();
        assert_eq!(same.take::<u64>(), 3);
    }

    #[test]
    #[should_panic(expected = "effect value type mismatch")]
    fn test_take_mismatch_panics() {
        Dynamic::new(1u8).take::<String>();
    }

    #[test]
    fn test_debug_formats_common_types() {
        assert_eq!(format!("{:?}", Dynamic::new("boom".to_string())), "\"boom\"");
        assert_eq!(format!("{:?}", Dynamic::new(7i32)), "7");
        assert_eq!(format!("{:?}", Dynamic::unit()), "<()>");
    }
}
