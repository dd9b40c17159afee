//! Method layer chains.
//!
//! A method is an ordered list of handlers. The last registered layer runs
//! first and reaches the previous one through [`MethodCall::super_call`].

use crate::collection::RecordCollection;
use crate::error::{CoreError, CoreResult};
use crate::value::Value;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

pub type MethodHandler = Arc<dyn Fn(&MethodCall<'_>, &[Value]) -> CoreResult<Value> + Send + Sync>;

#[derive(Clone)]
pub struct Method {
    name: String,
    layers: Vec<MethodHandler>,
}

impl Method {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layers: Vec::new(),
        }
    }

    pub(crate) fn push_layer(&mut self, handler: MethodHandler) {
        self.layers.push(handler);
    }

    /// Puts `base` layers underneath the current ones.
    pub(crate) fn prepend_layers(&mut self, base: &Method) {
        let mut layers = base.layers.clone();
        layers.append(&mut self.layers);
        self.layers = layers;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Runs the outermost layer on `records`.
    pub fn invoke<'e>(&'e self, records: &RecordCollection<'e>, args: &[Value]) -> CoreResult<Value> {
        let Some(top) = self.layers.len().checked_sub(1) else {
            return Err(CoreError::invariant(format!(
                "method `{}` has no implementation",
                self.name
            )));
        };
        let call = MethodCall {
            records: records.clone(),
            method: self,
            layer: top,
        };
        (self.layers[top])(&call, args)
    }
}

impl Debug for Method {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("layers", &self.layers.len())
            .finish()
    }
}

/// Execution frame of one layer.
pub struct MethodCall<'e> {
    records: RecordCollection<'e>,
    method: &'e Method,
    layer: usize,
}

impl<'e> MethodCall<'e> {
    pub fn records(&self) -> &RecordCollection<'e> {
        &self.records
    }

    pub fn method_name(&self) -> &str {
        self.method.name()
    }

    /// Index of the running layer, `0` being the base implementation.
    pub fn layer(&self) -> usize {
        self.layer
    }

    /// Invokes the previous layer with the same records.
    pub fn super_call(&self, args: &[Value]) -> CoreResult<Value> {
        let Some(parent) = self.layer.checked_sub(1) else {
            return Err(CoreError::invariant(format!(
                "method `{}` has no parent layer",
                self.method.name()
            )));
        };
        let call = MethodCall {
            records: self.records.clone(),
            method: self.method,
            layer: parent,
        };
        (self.method.layers[parent])(&call, args)
    }
}
