//! Lazily-resolvable configuration value trees
//!
//! Chart set-args and in-memory manifests accept [`Value`] leaves: scalars,
//! byte sequences, homogeneous arrays, or deferred functions evaluated at the
//! moment the owning resource is materialized. [`NestedValue`] additionally
//! permits string-keyed maps as intermediate nodes, and is what helm values
//! files and manifest objects are built from.
//!
//! Deferred functions have one canonical shape — orchestrator handle, run
//! context, owning cluster — with adapter constructors for the reduced
//! arities. The orchestrator never evaluates them at registration time;
//! resolution happens inside the action node after all dependencies complete.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine as _;
use futures::future::BoxFuture;

use crate::cluster::Cluster;
use crate::job::RunContext;
use crate::suite::Kindling;
use crate::{Error, Result};

/// A map of flat values, e.g. a release's `--set` arguments
pub type Object = BTreeMap<String, Value>;

/// A recursive map, e.g. a helm values document or an in-memory manifest
pub type NestedObject = BTreeMap<String, NestedValue>;

/// Arguments passed to a deferred value at resolution time
#[derive(Clone)]
pub struct ValueContext {
    /// Orchestrator handle for the spec-state being materialized
    pub harness: Kindling,
    /// The run's shared cancellation context
    pub ctx: RunContext,
    /// The owning cluster of the resource being materialized
    pub cluster: Arc<dyn Cluster>,
}

type DeferredFn =
    dyn Fn(&ValueContext) -> BoxFuture<'static, Result<NestedValue>> + Send + Sync;

/// A deferred computation producing a value once its resource materializes
#[derive(Clone)]
pub struct Deferred {
    f: Arc<DeferredFn>,
}

impl Deferred {
    /// Canonical constructor: `f(orchestrator, ctx, cluster)`
    pub fn new<F, Fut, T>(f: F) -> Self
    where
        F: Fn(Kindling, RunContext, Arc<dyn Cluster>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Into<NestedValue>,
    {
        Self {
            f: Arc::new(move |cx: &ValueContext| {
                let fut = f(cx.harness.clone(), cx.ctx.clone(), cx.cluster.clone());
                Box::pin(async move { fut.await.map(Into::into) })
            }),
        }
    }

    /// Adapter for the reduced arity `f(ctx)`
    pub fn from_ctx_fn<F, Fut, T>(f: F) -> Self
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Into<NestedValue>,
    {
        Self::new(move |_, ctx, _| f(ctx))
    }

    /// Adapter for the reduced arity `f(ctx, cluster)`
    pub fn from_cluster_fn<F, Fut, T>(f: F) -> Self
    where
        F: Fn(RunContext, Arc<dyn Cluster>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Into<NestedValue>,
    {
        Self::new(move |_, ctx, cluster| f(ctx, cluster))
    }

    async fn call(&self, cx: &ValueContext) -> Result<NestedValue> {
        self.f.as_ref()(cx).await
    }
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Deferred")
    }
}

/// A flat configuration value: scalar, bytes, array, or deferred
#[derive(Clone, Debug)]
pub enum Value {
    /// A string scalar
    String(String),
    /// An integer scalar
    Int(i64),
    /// A float scalar
    Float(f64),
    /// A boolean scalar
    Bool(bool),
    /// A byte sequence, rendered as base64 when realized
    Bytes(Vec<u8>),
    /// An array of values
    Array(Vec<Value>),
    /// A function evaluated at materialization time
    Deferred(Deferred),
}

/// A value tree that may also contain string-keyed maps
#[derive(Clone, Debug)]
pub enum NestedValue {
    /// A flat value leaf
    Value(Value),
    /// An array of nested values
    Array(Vec<NestedValue>),
    /// A string-keyed map node
    Map(NestedObject),
}

impl Value {
    /// A deferred value with the canonical `f(orchestrator, ctx, cluster)` shape
    pub fn deferred<F, Fut, T>(f: F) -> Self
    where
        F: Fn(Kindling, RunContext, Arc<dyn Cluster>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Into<NestedValue>,
    {
        Value::Deferred(Deferred::new(f))
    }

    /// A deferred value taking only the run context
    pub fn deferred_with_ctx<F, Fut, T>(f: F) -> Self
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Into<NestedValue>,
    {
        Value::Deferred(Deferred::from_ctx_fn(f))
    }

    /// A deferred value taking the run context and the owning cluster
    pub fn deferred_with_cluster<F, Fut, T>(f: F) -> Self
    where
        F: Fn(RunContext, Arc<dyn Cluster>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Into<NestedValue>,
    {
        Value::Deferred(Deferred::from_cluster_fn(f))
    }

    /// A byte-sequence value
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(bytes.into())
    }

    /// Recursively resolve every deferred leaf, producing a scalarized value.
    ///
    /// A deferred function in a flat position must not return a map.
    pub fn resolve<'a>(&'a self, cx: &'a ValueContext) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            match self {
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(item.resolve(cx).await?);
                    }
                    Ok(Value::Array(out))
                }
                Value::Deferred(d) => match d.call(cx).await? {
                    NestedValue::Value(v) => v.resolve(cx).await,
                    NestedValue::Array(items) => {
                        NestedValue::Array(items).resolve(cx).await?.into_flat()
                    }
                    NestedValue::Map(_) => Err(Error::value(
                        "deferred function in a flat position returned a map; \
                         maps are only permitted in nested values",
                    )),
                },
                other => Ok(other.clone()),
            }
        })
    }

    /// Resolve and encode for a chart `--set` argument in one step
    pub async fn resolve_set_arg(&self, cx: &ValueContext) -> Result<String> {
        self.resolve(cx).await?.encode_set_arg()
    }

    /// Encode an already-resolved value for a chart `--set` argument.
    ///
    /// Commas in scalar leaves are escaped with a backslash; arrays render as
    /// `{a,b,c}`; byte sequences emit base64. Deferred leaves are an error.
    pub fn encode_set_arg(&self) -> Result<String> {
        match self {
            Value::String(s) => Ok(s.replace(',', "\\,")),
            Value::Int(i) => Ok(i.to_string()),
            Value::Float(f) => Ok(f.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Bytes(b) => Ok(base64::engine::general_purpose::STANDARD.encode(b)),
            Value::Array(items) => {
                let leaves = items
                    .iter()
                    .map(Value::encode_set_arg)
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("{{{}}}", leaves.join(",")))
            }
            Value::Deferred(_) => Err(Error::value(
                "cannot encode an unresolved deferred value; resolve it first",
            )),
        }
    }

    /// Convert a resolved value to JSON. Bytes become base64 strings.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        match self {
            Value::String(s) => Ok(serde_json::Value::String(s.clone())),
            Value::Int(i) => Ok(serde_json::Value::from(*i)),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| Error::value(format!("float {} has no JSON representation", f))),
            Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
            Value::Bytes(b) => Ok(serde_json::Value::String(
                base64::engine::general_purpose::STANDARD.encode(b),
            )),
            Value::Array(items) => Ok(serde_json::Value::Array(
                items.iter().map(Value::to_json).collect::<Result<_>>()?,
            )),
            Value::Deferred(_) => Err(Error::value("cannot serialize an unresolved value")),
        }
    }
}

impl NestedValue {
    /// A deferred nested value with the canonical shape; the function may
    /// return maps.
    pub fn deferred<F, Fut, T>(f: F) -> Self
    where
        F: Fn(Kindling, RunContext, Arc<dyn Cluster>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Into<NestedValue>,
    {
        NestedValue::Value(Value::Deferred(Deferred::new(f)))
    }

    /// Recursively resolve every deferred leaf. Unlike [`Value::resolve`],
    /// deferred functions here may return map nodes.
    pub fn resolve<'a>(&'a self, cx: &'a ValueContext) -> BoxFuture<'a, Result<NestedValue>> {
        Box::pin(async move {
            match self {
                NestedValue::Value(Value::Deferred(d)) => {
                    d.call(cx).await?.resolve(cx).await
                }
                NestedValue::Value(v) => Ok(NestedValue::Value(v.resolve(cx).await?)),
                NestedValue::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(item.resolve(cx).await?);
                    }
                    Ok(NestedValue::Array(out))
                }
                NestedValue::Map(map) => {
                    let mut out = NestedObject::new();
                    for (k, v) in map {
                        out.insert(k.clone(), v.resolve(cx).await?);
                    }
                    Ok(NestedValue::Map(out))
                }
            }
        })
    }

    /// Convert a resolved nested value to JSON
    pub fn to_json(&self) -> Result<serde_json::Value> {
        match self {
            NestedValue::Value(v) => v.to_json(),
            NestedValue::Array(items) => Ok(serde_json::Value::Array(
                items.iter().map(NestedValue::to_json).collect::<Result<_>>()?,
            )),
            NestedValue::Map(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json()?);
                }
                Ok(serde_json::Value::Object(out))
            }
        }
    }

    fn into_flat(self) -> Result<Value> {
        match self {
            NestedValue::Value(v) => Ok(v),
            NestedValue::Array(items) => Ok(Value::Array(
                items
                    .into_iter()
                    .map(NestedValue::into_flat)
                    .collect::<Result<_>>()?,
            )),
            NestedValue::Map(_) => Err(Error::value(
                "map node is not permitted in a flat value position",
            )),
        }
    }
}

/// Resolve a full nested object and render it as JSON, ready for YAML output
pub async fn resolve_nested_object(
    object: &NestedObject,
    cx: &ValueContext,
) -> Result<serde_json::Value> {
    NestedValue::Map(object.clone()).resolve(cx).await?.to_json()
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u16> for Value {
    fn from(i: u16) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Value> for NestedValue {
    fn from(v: Value) -> Self {
        NestedValue::Value(v)
    }
}

impl From<&str> for NestedValue {
    fn from(s: &str) -> Self {
        NestedValue::Value(Value::from(s))
    }
}

impl From<String> for NestedValue {
    fn from(s: String) -> Self {
        NestedValue::Value(Value::from(s))
    }
}

impl From<i64> for NestedValue {
    fn from(i: i64) -> Self {
        NestedValue::Value(Value::from(i))
    }
}

impl From<i32> for NestedValue {
    fn from(i: i32) -> Self {
        NestedValue::Value(Value::from(i))
    }
}

impl From<u16> for NestedValue {
    fn from(i: u16) -> Self {
        NestedValue::Value(Value::from(i))
    }
}

impl From<f64> for NestedValue {
    fn from(f: f64) -> Self {
        NestedValue::Value(Value::from(f))
    }
}

impl From<bool> for NestedValue {
    fn from(b: bool) -> Self {
        NestedValue::Value(Value::from(b))
    }
}

impl From<NestedObject> for NestedValue {
    fn from(map: NestedObject) -> Self {
        NestedValue::Map(map)
    }
}

impl From<Vec<NestedValue>> for NestedValue {
    fn from(items: Vec<NestedValue>) -> Self {
        NestedValue::Array(items)
    }
}

/// Structural copy and composition helpers for value maps.
///
/// All value data is owned, so a clone already shares no mutable
/// substructure; these helpers exist to make composition read declaratively.
pub trait ObjectExt: Sized {
    /// The value type stored in this map
    type Item;

    /// Structural copy sharing no mutable substructure with the source
    fn deep_copy(&self) -> Self;

    /// Copy with one key set
    fn with(&self, key: impl Into<String>, value: impl Into<Self::Item>) -> Self;

    /// Copy with `other`'s entries layered on top of this map's
    fn merged_from(&self, other: &Self) -> Self;
}

impl ObjectExt for Object {
    type Item = Value;

    fn deep_copy(&self) -> Self {
        self.clone()
    }

    fn with(&self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut out = self.clone();
        out.insert(key.into(), value.into());
        out
    }

    fn merged_from(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (k, v) in other {
            out.insert(k.clone(), v.clone());
        }
        out
    }
}

impl ObjectExt for NestedObject {
    type Item = NestedValue;

    fn deep_copy(&self) -> Self {
        self.clone()
    }

    fn with(&self, key: impl Into<String>, value: impl Into<NestedValue>) -> Self {
        let mut out = self.clone();
        out.insert(key.into(), value.into());
        out
    }

    /// Map nodes merge recursively; anything else is replaced wholesale.
    fn merged_from(&self, other: &Self) -> Self {
        let mut out = self.clone();
        for (k, v) in other {
            match (out.get_mut(k), v) {
                (Some(NestedValue::Map(existing)), NestedValue::Map(incoming)) => {
                    *existing = existing.merged_from(incoming);
                }
                (slot, v) => {
                    if let Some(slot) = slot {
                        *slot = v.clone();
                    } else {
                        out.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        out
    }
}
