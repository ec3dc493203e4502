use shared::error::{Error, Result};
use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::rc::Rc;

/// Shared collaborators reachable from every handler of a pipeline, keyed by type.
///
/// A type has at most one registrant. Services live on the stream's worker,
/// so `Rc` is enough; mutable services use interior mutability.
#[derive(Default)]
pub struct ServiceRegistry {
    services: HashMap<TypeId, Rc<dyn Any>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Any>(&mut self, service: Rc<T>) -> Result<()> {
        let id = TypeId::of::<T>();
        if self.services.contains_key(&id) {
            return Err(Error::ErrServiceAlreadyRegistered(type_name::<T>()));
        }
        self.services.insert(id, service);
        Ok(())
    }

    pub fn get<T: Any>(&self) -> Option<Rc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .and_then(|service| Rc::clone(service).downcast::<T>().ok())
    }

    pub fn unregister<T: Any>(&mut self) -> Option<Rc<T>> {
        self.services
            .remove(&TypeId::of::<T>())
            .and_then(|service| service.downcast::<T>().ok())
    }

    pub fn contains<T: Any>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
