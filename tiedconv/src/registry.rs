//! Named convolution layers that tied layers resolve by identifier.
//!
//! The registry borrows the layers it names, so a lookup always sees the
//! weights the owning model holds at that moment.

use std::collections::HashMap;

use burn::nn::conv::Conv2d;
use burn::prelude::*;

use crate::error::{LayerError, Result};

/// Borrowed `Conv2d` layers, keyed by the identifier a tied layer stores.
#[derive(Debug)]
pub struct LayerRegistry<'a, B: Backend> {
    layers: HashMap<String, &'a Conv2d<B>>,
}

impl<B: Backend> Default for LayerRegistry<'_, B> {
    fn default() -> Self {
        Self {
            layers: HashMap::new(),
        }
    }
}

impl<'a, B: Backend> LayerRegistry<'a, B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a layer, returning the one it replaces.
    pub fn insert(&mut self, name: impl Into<String>, layer: &'a Conv2d<B>) -> Option<&'a Conv2d<B>> {
        self.layers.insert(name.into(), layer)
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, layer: &'a Conv2d<B>) -> Self {
        self.insert(name, layer);
        self
    }

    pub fn get(&self, name: &str) -> Option<&'a Conv2d<B>> {
        self.layers.get(name).copied()
    }

    /// Current kernel of a registered layer, `[out, in, kh, kw]`.
    pub fn kernel(&self, name: &str) -> Result<Tensor<B, 4>> {
        self.get(name)
            .map(|conv| conv.weight.val())
            .ok_or_else(|| LayerError::TiedLayerNotFound(name.to_string()))
    }
}
