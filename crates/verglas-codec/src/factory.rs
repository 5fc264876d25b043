use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{UserException, Value, ValuePtr};

/// Produces an empty instance for a concrete class type id, to be filled by
/// `unmarshal`.
pub type ValueFactory = Arc<dyn Fn(&str) -> Option<ValuePtr> + Send + Sync>;

/// Produces an empty instance for an exception type id.
pub type ExceptionFactory = Arc<dyn Fn(&str) -> Option<Box<dyn UserException>> + Send + Sync>;

/// Process-wide registry of value and exception factories.
///
/// Lookups happen only while decoding class-typed data, which is rare
/// relative to invocations, so a single mutex is fine here.
#[derive(Default)]
pub struct FactoryRegistry {
    values: Mutex<HashMap<String, ValueFactory>>,
    exceptions: Mutex<HashMap<String, ExceptionFactory>>,
    compact_ids: Mutex<HashMap<i32, String>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        FactoryRegistry::default()
    }

    /// Register a factory for `type_id`. Returns false when the id was
    /// already taken; the existing factory stays.
    pub fn add_value_factory(&self, type_id: &str, factory: ValueFactory) -> bool {
        let mut values = self.values.lock();
        if values.contains_key(type_id) {
            return false;
        }
        values.insert(type_id.to_owned(), factory);
        true
    }

    /// Convenience registration for a default-constructible class.
    pub fn add_value<V>(&self, type_id: &str) -> bool
    where
        V: Value + Default + 'static,
    {
        self.add_value_factory(
            type_id,
            Arc::new(|_| Some(Rc::new(RefCell::new(V::default())) as ValuePtr)),
        )
    }

    pub fn find_value_factory(&self, type_id: &str) -> Option<ValueFactory> {
        self.values.lock().get(type_id).cloned()
    }

    pub fn create_value(&self, type_id: &str) -> Option<ValuePtr> {
        let factory = self.find_value_factory(type_id)?;
        factory(type_id)
    }

    pub fn add_exception_factory(&self, type_id: &str, factory: ExceptionFactory) -> bool {
        let mut exceptions = self.exceptions.lock();
        if exceptions.contains_key(type_id) {
            return false;
        }
        exceptions.insert(type_id.to_owned(), factory);
        true
    }

    /// Convenience registration for a default-constructible exception.
    pub fn add_exception<E>(&self, type_id: &str) -> bool
    where
        E: UserException + Default + 'static,
    {
        self.add_exception_factory(
            type_id,
            Arc::new(|_| Some(Box::new(E::default()) as Box<dyn UserException>)),
        )
    }

    pub fn create_exception(&self, type_id: &str) -> Option<Box<dyn UserException>> {
        let factory = self.exceptions.lock().get(type_id).cloned()?;
        factory(type_id)
    }

    /// Map a numeric compact id back to its string type id.
    pub fn add_compact_id(&self, compact_id: i32, type_id: &str) {
        self.compact_ids.lock().insert(compact_id, type_id.to_owned());
    }

    pub fn resolve_compact_id(&self, compact_id: i32) -> Option<String> {
        self.compact_ids.lock().get(&compact_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EncodingError, InputStream, OutputStream};
    use std::any::Any;

    #[derive(Default)]
    struct Dummy;

    impl Value for Dummy {
        fn type_id(&self) -> &str {
            "::Test::Dummy"
        }
        fn marshal(&self, _out: &mut OutputStream) -> Result<(), EncodingError> {
            Ok(())
        }
        fn unmarshal(&mut self, _input: &mut InputStream) -> Result<(), EncodingError> {
            Ok(())
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = FactoryRegistry::new();
        assert!(registry.add_value::<Dummy>("::Test::Dummy"));
        assert!(!registry.add_value::<Dummy>("::Test::Dummy"));
    }

    #[test]
    fn create_returns_fresh_instances() {
        let registry = FactoryRegistry::new();
        registry.add_value::<Dummy>("::Test::Dummy");
        let a = registry.create_value("::Test::Dummy").unwrap();
        let b = registry.create_value("::Test::Dummy").unwrap();
        assert!(!Rc::ptr_eq(&a, &b));
        assert!(registry.create_value("::Test::Other").is_none());
    }

    #[test]
    fn compact_id_resolution() {
        let registry = FactoryRegistry::new();
        registry.add_compact_id(4, "::Test::Dummy");
        assert_eq!(registry.resolve_compact_id(4).as_deref(), Some("::Test::Dummy"));
        assert_eq!(registry.resolve_compact_id(5), None);
    }
}
