//! Service descriptors: what a server exposes and how methods are named.
//!
//! A service is an interface name plus a table of invocable methods keyed by
//! *method identity*: the method name concatenated with its parameter type
//! names in source order, e.g. `add(i64,i64)`. The identity disambiguates
//! overloads and fixes the declared parameter count; both peers validate
//! argument arity against it. How the invocation closures are produced
//! (hand-written, generated from trait definitions) is the caller's concern;
//! the framework only needs the table.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::InvokeError;

/// Outcome of one method invocation.
pub type MethodResult = Result<Value, InvokeError>;

/// Type-erased invocation closure stored in a service table.
pub type MethodHandler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, MethodResult> + Send + Sync>;

/// Declared parameter count of a method identity, `None` if malformed.
///
/// `ping()` declares zero parameters, `add(i64,i64)` declares two. Anything
/// without a trailing parenthesized list is malformed.
pub fn parameter_count(identity: &str) -> Option<usize> {
    let open = identity.find('(')?;
    if open == 0 || !identity.ends_with(')') {
        return None;
    }
    let params = &identity[open + 1..identity.len() - 1];
    if params.is_empty() {
        Some(0)
    } else {
        Some(params.split(',').count())
    }
}

/// One registrable interface: a name and its method table.
#[derive(Clone)]
pub struct ServiceDescriptor {
    name: String,
    methods: HashMap<String, MethodHandler>,
}

impl ServiceDescriptor {
    pub fn new<S: Into<String>>(name: S) -> ServiceDescriptor {
        ServiceDescriptor { name: name.into(), methods: HashMap::new() }
    }

    /// Adds a method under the given identity.
    ///
    /// # Panics
    ///
    /// Panics on a malformed identity; descriptors are built at startup and
    /// a bad identity is a programming error.
    pub fn method<F, Fut>(mut self, identity: &str, handler: F) -> ServiceDescriptor
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        assert!(
            parameter_count(identity).is_some(),
            "malformed method identity `{identity}`; expected `name(type,...)`"
        );
        self.methods
            .insert(identity.to_string(), Arc::new(move |args| Box::pin(handler(args))));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lookup(&self, identity: &str) -> Option<&MethodHandler> {
        self.methods.get(identity)
    }
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut identities: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        identities.sort_unstable();
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("methods", &identities)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_count_parses_identities() {
        assert_eq!(parameter_count("ping()"), Some(0));
        assert_eq!(parameter_count("add(i64,i64)"), Some(2));
        assert_eq!(parameter_count("join(String,String,String)"), Some(3));
        assert_eq!(parameter_count("bare"), None);
        assert_eq!(parameter_count("()"), None);
        assert_eq!(parameter_count("open(path"), None);
    }

    #[tokio::test]
    async fn descriptor_lookup_and_invoke() {
        let service = ServiceDescriptor::new("Echo")
            .method("echo(json)", |mut args| async move { Ok(args.remove(0)) });
        assert_eq!(service.name(), "Echo");
        assert!(service.lookup("missing()").is_none());

        let handler = service.lookup("echo(json)").expect("registered").clone();
        let out = handler(vec![Value::from("hello")]).await.expect("invoke");
        assert_eq!(out, Value::from("hello"));
    }
}
