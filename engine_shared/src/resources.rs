//! Model lookup.
//!
//! Loading model files is someone else's job; the control layer asks for a
//! model by name and treats the result as opaque. Hosts downcast it back.

use std::{
    any::Any,
    collections::HashMap,
    sync::Arc,
};

/// Opaque model handle.
pub type Model = Arc<dyn Any + Send + Sync>;

/// Source of clonable models by name.
pub trait ModelLoader: Send + Sync {
    /// A fresh clone of the named model, or `None` if it is not loaded.
    fn create_model(&self, name: &str) -> Option<Model>;
}

/// In-memory model library. Each `create_model` hands out a new clone.
pub struct ModelLibrary<M> {
    by_name: HashMap<String, M>,
}

impl<M> Default for ModelLibrary<M> {
    fn default() -> Self {
        Self {
            by_name: HashMap::new(),
        }
    }
}

impl<M> ModelLibrary<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a model.
    pub fn insert(&mut self, name: impl Into<String>, model: M) {
        self.by_name.insert(name.into(), model);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }
}

impl<M: Clone + Send + Sync + 'static> ModelLoader for ModelLibrary<M> {
    fn create_model(&self, name: &str) -> Option<Model> {
        self.by_name
            .get(name)
            .map(|m| Arc::new(m.clone()) as Model)
    }
}

/// Loader with no models at all.
#[derive(Debug, Default)]
pub struct NoModels;

impl ModelLoader for NoModels {
    fn create_model(&self, _name: &str) -> Option<Model> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_model_hands_out_clones() {
        let mut lib = ModelLibrary::new();
        lib.insert("ship", vec![1u8, 2, 3]);

        let a = lib.create_model("ship").unwrap();
        let b = lib.create_model("ship").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.downcast_ref::<Vec<u8>>(), Some(&vec![1, 2, 3]));
        assert!(lib.create_model("rock").is_none());
        assert!(NoModels.create_model("ship").is_none());
    }
}
