//! In-memory cluster for tests
//!
//! Behaves like a small API server: names are unique per kind and namespace,
//! creates of a taken name return 409, deletes can be made to linger or to
//! wait on finalizers, and any call can be scripted to fail with a status code.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use kube::api::DynamicObject;
use serde_json::Value;

use llmops_common::error::api_error;
use llmops_common::{Error, Result};

use crate::cluster::{ClusterApi, ListSelector, ResourceKind};

type ObjectKey = (ResourceKind, String, String);

#[derive(Default)]
struct FakeState {
    objects: BTreeMap<ObjectKey, Value>,
    linger: HashMap<(ResourceKind, String), u32>,
    stuck: HashSet<(ResourceKind, String)>,
    finalizers_cleared: HashSet<(ResourceKind, String)>,
    scripted: HashMap<(&'static str, ResourceKind), VecDeque<u16>>,
    calls: HashMap<&'static str, usize>,
    deletes: usize,
    isvc_available: bool,
    next_uid: u64,
}

/// [`ClusterApi`] over an in-memory object map
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fake with the InferenceService API installed
    pub fn with_inference_service() -> Self {
        let fake = Self::new();
        fake.state.lock().unwrap().isvc_available = true;
        fake
    }

    /// Insert an object directly
    pub fn seed(&self, kind: ResourceKind, namespace: &str, body: Value) {
        let mut state = self.state.lock().unwrap();
        let body = normalize(&mut state, kind, namespace, body);
        let name = object_name(&body);
        state
            .objects
            .insert((kind, namespace.to_string(), name), body);
    }

    /// Add a pod labeled `app=<app>` with the given `status`
    pub fn add_pod(&self, namespace: &str, name: &str, app: &str, status: Value) {
        self.seed(
            ResourceKind::Pod,
            namespace,
            serde_json::json!({
                "metadata": {"name": name, "labels": {"app": app}},
                "status": status,
            }),
        );
    }

    /// After delete, keep the object terminating for `polls` further reads
    pub fn linger_after_delete(&self, kind: ResourceKind, name: &str, polls: u32) {
        self.state
            .lock()
            .unwrap()
            .linger
            .insert((kind, name.to_string()), polls);
    }

    /// After delete, keep the object terminating until its finalizers are cleared
    pub fn stick_on_finalizers(&self, kind: ResourceKind, name: &str) {
        self.state
            .lock()
            .unwrap()
            .stuck
            .insert((kind, name.to_string()));
    }

    /// Set a deletion timestamp without deleting
    pub fn mark_terminating(&self, kind: ResourceKind, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(obj) = state
            .objects
            .get_mut(&(kind, namespace.to_string(), name.to_string()))
        {
            obj["metadata"]["deletionTimestamp"] = Value::from("2024-01-01T00:00:00Z");
        }
    }

    /// Fail the next call of `op` on `kind` with `code`
    pub fn fail_next(&self, op: &'static str, kind: ResourceKind, code: u16) {
        self.fail_times(op, kind, code, 1);
    }

    /// Fail the next `times` calls of `op` on `kind` with `code`
    pub fn fail_times(&self, op: &'static str, kind: ResourceKind, code: u16, times: usize) {
        let mut state = self.state.lock().unwrap();
        let queue = state.scripted.entry((op, kind)).or_default();
        queue.extend(std::iter::repeat(code).take(times));
    }

    pub fn contains(&self, kind: ResourceKind, namespace: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .objects
            .contains_key(&(kind, namespace.to_string(), name.to_string()))
    }

    pub fn object(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Objects of `kind` in `namespace`
    pub fn count(&self, kind: ResourceKind, namespace: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(k, ns, _)| *k == kind && ns == namespace)
            .count()
    }

    /// Total objects across every kind and namespace
    pub fn total(&self) -> usize {
        self.state.lock().unwrap().objects.len()
    }

    pub fn deletes(&self) -> usize {
        self.state.lock().unwrap().deletes
    }

    /// Calls made to `op` ("get", "list", "create", "patch", "delete")
    pub fn calls(&self, op: &'static str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(op)
            .copied()
            .unwrap_or_default()
    }

    pub fn finalizers_cleared(&self, kind: ResourceKind, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .finalizers_cleared
            .contains(&(kind, name.to_string()))
    }

    fn begin(&self, op: &'static str, kind: ResourceKind) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(op).or_default() += 1;
        let code = state
            .scripted
            .get_mut(&(op, kind))
            .and_then(|queue| queue.pop_front());
        match code {
            Some(code) => Err(Error::from(api_error(code, "Scripted", op))),
            None => Ok(()),
        }
    }
}

fn object_name(body: &Value) -> String {
    body["metadata"]["name"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

fn normalize(state: &mut FakeState, kind: ResourceKind, namespace: &str, mut body: Value) -> Value {
    let ar = kind.api_resource();
    if body.get("apiVersion").is_none() {
        body["apiVersion"] = Value::from(ar.api_version);
    }
    if body.get("kind").is_none() {
        body["kind"] = Value::from(ar.kind);
    }
    if body.get("metadata").is_none() {
        body["metadata"] = serde_json::json!({});
    }
    body["metadata"]["namespace"] = Value::from(namespace);
    if body["metadata"].get("uid").is_none() {
        state.next_uid += 1;
        body["metadata"]["uid"] = Value::from(format!("uid-{}", state.next_uid));
    }
    body
}

fn to_object(body: &Value) -> Result<DynamicObject> {
    serde_json::from_value(body.clone()).map_err(Error::from)
}

fn is_terminating(body: &Value) -> bool {
    !body["metadata"]["deletionTimestamp"].is_null()
}

fn matches_labels(body: &Value, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => body["metadata"]["labels"][k].as_str() == Some(v),
            None => false,
        })
}

fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    target.remove(key);
                } else {
                    merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynamicObject>> {
        self.begin("get", kind)?;
        let mut state = self.state.lock().unwrap();
        let key = (kind, namespace.to_string(), name.to_string());
        let Some(body) = state.objects.get(&key).cloned() else {
            return Ok(None);
        };
        if !is_terminating(&body) {
            return to_object(&body).map(Some);
        }

        let gc_key = (kind, name.to_string());
        if state.stuck.contains(&gc_key) {
            return to_object(&body).map(Some);
        }
        let remaining = state.linger.get(&gc_key).copied().unwrap_or_default();
        if remaining > 0 {
            state.linger.insert(gc_key, remaining - 1);
            to_object(&body).map(Some)
        } else {
            state.objects.remove(&key);
            Ok(None)
        }
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &ListSelector,
    ) -> Result<Vec<DynamicObject>> {
        self.begin("list", kind)?;
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .filter(|(_, body)| match selector {
                ListSelector::All => true,
                ListSelector::Labels(labels) => matches_labels(body, labels),
            })
            .map(|(_, body)| to_object(body))
            .collect()
    }

    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        body: Value,
    ) -> Result<DynamicObject> {
        self.begin("create", kind)?;
        let mut state = self.state.lock().unwrap();
        let name = object_name(&body);
        let key = (kind, namespace.to_string(), name.clone());
        if state.objects.contains_key(&key) {
            return Err(Error::from(api_error(
                409,
                "AlreadyExists",
                &format!("{} \"{}\" already exists", kind, name),
            )));
        }
        let body = normalize(&mut state, kind, namespace, body);
        let obj = to_object(&body)?;
        state.objects.insert(key, body);
        Ok(obj)
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        patch: Value,
    ) -> Result<()> {
        self.begin("patch", kind)?;
        let mut state = self.state.lock().unwrap();
        let key = (kind, namespace.to_string(), name.to_string());
        let Some(body) = state.objects.get_mut(&key) else {
            return Err(Error::from(api_error(404, "NotFound", name)));
        };
        merge_patch(body, &patch);

        let clears_finalizers = patch["metadata"]
            .as_object()
            .is_some_and(|m| m.get("finalizers").is_some_and(Value::is_null));
        if clears_finalizers {
            let gc_key = (kind, name.to_string());
            if state.stuck.remove(&gc_key) {
                state.finalizers_cleared.insert(gc_key);
            }
        }
        Ok(())
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        grace_period_secs: Option<u32>,
    ) -> Result<bool> {
        self.begin("delete", kind)?;
        let mut state = self.state.lock().unwrap();
        let key = (kind, namespace.to_string(), name.to_string());
        if !state.objects.contains_key(&key) {
            return Ok(false);
        }
        state.deletes += 1;

        let gc_key = (kind, name.to_string());
        let delayed = state.stuck.contains(&gc_key) || state.linger.contains_key(&gc_key);
        if delayed && grace_period_secs != Some(0) {
            if let Some(body) = state.objects.get_mut(&key) {
                body["metadata"]["deletionTimestamp"] = Value::from("2024-01-01T00:00:00Z");
            }
        } else {
            state.objects.remove(&key);
        }
        Ok(true)
    }

    async fn inference_service_available(&self, _namespace: &str) -> bool {
        self.state.lock().unwrap().isvc_available
    }
}
