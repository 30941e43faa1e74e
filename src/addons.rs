//! Addon Pipeline Module
//!
//! Pluggable post-processing of fetched payloads. Each addon reads one
//! payload item and returns a value stored under `item.addons.<name>`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use serde_json::{Map, Value};
use tracing::{debug, error};

/// Field on each item holding addon output.
pub const ADDONS_FIELD: &str = "addons";

// == Addon Trait ==
/// A transform applied to single payload items.
#[async_trait]
pub trait Addon: Send + Sync {
    /// Key under `item.addons` receiving the output
    fn name(&self) -> &str;

    async fn apply(&self, item: &Value) -> anyhow::Result<Value>;
}

/// Addon backed by a synchronous closure.
pub struct FnAddon<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> Addon for FnAddon<F>
where
    F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, item: &Value) -> anyhow::Result<Value> {
        (self.f)(item)
    }
}

/// Wraps a closure as a shareable addon.
pub fn addon_fn<F>(name: impl Into<String>, f: F) -> Arc<dyn Addon>
where
    F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(FnAddon {
        name: name.into(),
        f,
    })
}

// == Addon Selection ==
/// Which items addons run on.
#[derive(Clone)]
pub enum Addons {
    /// Run on the payload itself, or on each element if it is an array
    AllFields(Vec<Arc<dyn Addon>>),
    /// Run on the named top-level fields only (each element if the field is an array)
    ByField(BTreeMap<String, Vec<Arc<dyn Addon>>>),
}

impl fmt::Debug for Addons {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |fns: &[Arc<dyn Addon>]| fns.iter().map(|a| a.name().to_string()).collect::<Vec<_>>();
        match self {
            Addons::AllFields(fns) => f.debug_tuple("AllFields").field(&names(fns)).finish(),
            Addons::ByField(map) => {
                let fields: BTreeMap<&String, Vec<String>> =
                    map.iter().map(|(k, fns)| (k, names(fns))).collect();
                f.debug_tuple("ByField").field(&fields).finish()
            }
        }
    }
}

impl Addons {
    /// Scopes `addons` to a single top-level field.
    pub fn for_field(field: impl Into<String>, addons: Vec<Arc<dyn Addon>>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(field.into(), addons);
        Addons::ByField(map)
    }

    /// JSON pointers of the items each addon list applies to.
    fn targets<'a>(&'a self, payload: &Value) -> Vec<(String, &'a [Arc<dyn Addon>])> {
        match self {
            Addons::AllFields(fns) => item_pointers(payload, "")
                .into_iter()
                .map(|p| (p, fns.as_slice()))
                .collect(),
            Addons::ByField(map) => map
                .iter()
                .filter_map(|(field, fns)| {
                    let value = payload.as_object()?.get(field)?;
                    let base = format!("/{}", escape_pointer(field));
                    Some(
                        item_pointers(value, &base)
                            .into_iter()
                            .map(|p| (p, fns.as_slice()))
                            .collect::<Vec<_>>(),
                    )
                })
                .flatten()
                .collect(),
        }
    }
}

fn item_pointers(value: &Value, base: &str) -> Vec<String> {
    match value {
        Value::Array(items) => (0..items.len()).map(|i| format!("{}/{}", base, i)).collect(),
        _ => vec![base.to_string()],
    }
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

// == Pipeline ==
/// Runs `addons` over `payload`, writing results into each item's `addons` field.
///
/// All transforms of the call run concurrently and are committed together:
/// if any fails, nothing is written and the failure is logged here, never
/// returned. Returns whether the outputs were applied.
pub async fn apply(payload: &mut Value, addons: &Addons) -> bool {
    let targets = addons.targets(payload);

    let mut jobs = Vec::new();
    for (pointer, fns) in targets {
        let Some(item) = payload.pointer(&pointer) else {
            continue;
        };
        let item = Arc::new(item.clone());
        for addon in fns {
            let addon = addon.clone();
            let item = item.clone();
            let pointer = pointer.clone();
            jobs.push(async move {
                let output = addon.apply(&item).await?;
                Ok::<_, anyhow::Error>((pointer, addon.name().to_string(), output))
            });
        }
    }
    if jobs.is_empty() {
        return true;
    }

    let count = jobs.len();
    let outputs = match try_join_all(jobs).await {
        Ok(outputs) => outputs,
        Err(e) => {
            error!(error = %e, transforms = count, "Addon batch failed");
            return false;
        }
    };

    for (pointer, name, output) in outputs {
        match payload.pointer_mut(&pointer) {
            Some(Value::Object(item)) => {
                let slot = item
                    .entry(ADDONS_FIELD)
                    .or_insert_with(|| Value::Object(Map::new()));
                if !slot.is_object() {
                    *slot = Value::Object(Map::new());
                }
                if let Value::Object(slot) = slot {
                    slot.insert(name, output);
                }
            }
            _ => debug!(pointer = %pointer, addon = %name, "Addon target is not an object, skipped"),
        }
    }
    debug!(transforms = count, "Applied addons");
    true
}
