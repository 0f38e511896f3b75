/// Handler registry: turns declared service methods into routable descriptors
/// consumed by both the REST and WebSocket dispatch engines
use crate::errors::ApiError;
use crate::session::Session;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

/// Argument names supplied by the transport layer rather than the caller
const RESERVED_ARGUMENT_NAMES: &[&str] = &["session", "extra"];

/// HTTP verb a handler is exposed under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Post,
}

impl Verb {
    /// Recognized member-name prefixes, in match order
    const PREFIXES: &'static [(&'static str, Verb)] = &[("get", Verb::Get), ("post", Verb::Post)];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::Post => "post",
        }
    }
}

/// Transport the current call arrived over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Rest,
    Websocket,
}

/// A raw transport response produced by a delegated handler
///
/// The dispatcher writes it verbatim and skips envelope construction.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

/// Terminal outcome of a successful handler invocation
#[derive(Debug, Clone)]
pub enum Outcome {
    /// A value to wrap in the transport envelope
    Value(Value),
    /// The handler produced the full response itself
    Delegated(RawResponse),
}

/// Server-to-client channel exposed to handlers on connection-oriented
/// transports; writes are refused once the connection leaves the open state
pub trait ClientChannel: Send + Sync {
    fn request(&self, method: &str, params: Value);
    fn is_open(&self) -> bool;
}

/// Per-call context handed to every handler alongside its bound arguments
#[derive(Clone)]
pub struct CallContext {
    pub session: Session,
    pub transport: Transport,
    /// Present on WebSocket calls only
    pub connection: Option<Arc<dyn ClientChannel>>,
    /// Read-only map of sibling namespaces for the invoked handler's
    /// namespace, built by `HandlerRegistry::cross_link`
    pub siblings: Arc<HashMap<String, Arc<dyn ApiService>>>,
}

impl CallContext {
    pub fn new(session: Session, transport: Transport) -> Self {
        Self {
            session,
            transport,
            connection: None,
            siblings: Arc::new(HashMap::new()),
        }
    }

    pub fn with_connection(mut self, connection: Arc<dyn ClientChannel>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_siblings(mut self, siblings: Arc<HashMap<String, Arc<dyn ApiService>>>) -> Self {
        self.siblings = siblings;
        self
    }
}

/// An invokable service method
#[async_trait]
pub trait Method: Send + Sync {
    /// Invoke with arguments bound in declared order
    async fn invoke(&self, args: Vec<Value>, ctx: CallContext) -> Result<Outcome, ApiError>;
}

/// Adapter turning an async closure into a `Method`
pub fn method<F, Fut>(f: F) -> Arc<dyn Method>
where
    F: Fn(Vec<Value>, CallContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, ApiError>> + Send + 'static,
{
    struct FnMethod<F>(F);

    #[async_trait]
    impl<F, Fut> Method for FnMethod<F>
    where
        F: Fn(Vec<Value>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Outcome, ApiError>> + Send + 'static,
    {
        async fn invoke(&self, args: Vec<Value>, ctx: CallContext) -> Result<Outcome, ApiError> {
            (self.0)(args, ctx).await
        }
    }

    Arc::new(FnMethod(f))
}

/// Compile-time metadata for one declared service member
///
/// Each service states its member names and ordered parameter lists
/// explicitly; nothing is inferred at runtime.
#[derive(Clone)]
pub struct MethodDef {
    /// Declared member name, e.g. "getUserProfile"
    pub member: &'static str,
    /// Declared parameter names in order, including transport-context names
    pub params: &'static [&'static str],
    pub handler: Arc<dyn Method>,
}

/// A registrable service object
pub trait ApiService: Send + Sync {
    fn methods(&self) -> Vec<MethodDef>;

    /// Members excluded from registration even when they carry a verb prefix
    fn ignored_methods(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Registry entry describing how to route to and invoke one exposed method
#[derive(Clone)]
pub struct HandlerDescriptor {
    pub namespace: String,
    /// Canonical dash-case name, e.g. "user-profile"
    pub name: String,
    pub verb: Verb,
    /// Caller-supplied argument names, reserved names filtered out
    pub argument_names: Vec<String>,
    /// REST route template
    pub route: String,
    pub handler: Arc<dyn Method>,
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("verb", &self.verb)
            .field("argument_names", &self.argument_names)
            .field("route", &self.route)
            .finish()
    }
}

/// Verb and canonical name derived from a declared member name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSignature {
    pub verb: Verb,
    pub name: String,
}

/// Strip the verb prefix from a member name and dash-case the remainder
///
/// Returns `None` when no recognized verb prefix matches; the caller skips
/// such members instead of failing the whole registration.
pub fn derive_signature(member_name: &str) -> Option<HandlerSignature> {
    let (verb, remainder) = Verb::PREFIXES.iter().find_map(|(prefix, verb)| {
        member_name
            .strip_prefix(prefix)
            .map(|remainder| (*verb, remainder))
    })?;

    Some(HandlerSignature {
        verb,
        name: to_url_name(remainder),
    })
}

/// "UserProfile" -> "user-profile" style conversion
fn to_url_name(name: &str) -> String {
    let mut url_name = String::with_capacity(name.len() + 4);

    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                url_name.push('-');
            }
            url_name.extend(c.to_lowercase());
        } else {
            url_name.push(c);
        }
    }

    url_name
}

/// Drop transport-context and underscore-prefixed parameter names
fn filter_argument_names(params: &[&str]) -> Vec<String> {
    params
        .iter()
        .filter(|name| !name.starts_with('_') && !RESERVED_ARGUMENT_NAMES.contains(name))
        .map(|name| name.to_string())
        .collect()
}

/// Registry of all exposed handlers across every registered namespace
#[derive(Default)]
pub struct HandlerRegistry {
    /// Every registration in order, shadowed entries included
    descriptors: Vec<Arc<HandlerDescriptor>>,
    /// Route-resolution table; later registrations shadow earlier ones
    lookup: HashMap<(String, Verb, String), Arc<HandlerDescriptor>>,
    /// Registered API objects by namespace
    apis: HashMap<String, Arc<dyn ApiService>>,
    /// Namespaces in registration order
    namespaces: Vec<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every declared method of a service under a namespace
    ///
    /// Best-effort: members without a recognized verb prefix, ignored
    /// members and underscore-prefixed members are skipped silently.
    pub fn register_api(&mut self, namespace: &str, api: Arc<dyn ApiService>) {
        let ignored = api.ignored_methods();

        if !self.apis.contains_key(namespace) {
            self.namespaces.push(namespace.to_string());
        }
        self.apis.insert(namespace.to_string(), api.clone());

        for def in api.methods() {
            if def.member.starts_with('_') || ignored.contains(&def.member) {
                continue;
            }

            let signature = match derive_signature(def.member) {
                Some(signature) => signature,
                None => {
                    warn!(
                        namespace = %namespace,
                        member = %def.member,
                        "no verb prefix recognized, member not exposed"
                    );
                    continue;
                }
            };

            self.add_handler(
                namespace,
                &signature.name,
                signature.verb,
                filter_argument_names(def.params),
                def.handler,
            );
        }
    }

    fn add_handler(
        &mut self,
        namespace: &str,
        name: &str,
        verb: Verb,
        argument_names: Vec<String>,
        handler: Arc<dyn Method>,
    ) {
        let mut route = format!("/{}/{}", namespace, name);

        if verb != Verb::Post {
            for argument_name in &argument_names {
                route.push_str("/:");
                route.push_str(argument_name);
            }
        }

        info!(
            route = %route,
            verb = %verb.as_str(),
            arguments = ?argument_names,
            "added handler"
        );

        let descriptor = Arc::new(HandlerDescriptor {
            namespace: namespace.to_string(),
            name: name.to_string(),
            verb,
            argument_names,
            route,
            handler,
        });

        self.descriptors.push(descriptor.clone());
        self.lookup.insert(
            (namespace.to_string(), verb, name.to_string()),
            descriptor,
        );
    }

    /// Every registration, shadowed entries included
    pub fn descriptors(&self) -> &[Arc<HandlerDescriptor>] {
        &self.descriptors
    }

    /// Route-resolution view: one descriptor per (namespace, verb, name)
    pub fn routable(&self) -> Vec<Arc<HandlerDescriptor>> {
        let mut routable: Vec<_> = self.lookup.values().cloned().collect();
        routable.sort_by(|a, b| a.route.cmp(&b.route).then(a.verb.as_str().cmp(b.verb.as_str())));
        routable
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    pub fn api(&self, namespace: &str) -> Option<Arc<dyn ApiService>> {
        self.apis.get(namespace).cloned()
    }

    /// Resolve a JSON-RPC method of form "namespace.name" or bare "name"
    ///
    /// The verb is not part of WebSocket addressing. Bare names match across
    /// all namespaces; the latest registration wins, consistent with route
    /// shadowing.
    pub fn find_by_method(&self, method: &str) -> Option<Arc<HandlerDescriptor>> {
        let (namespace, name) = match method.split_once('.') {
            Some((namespace, name)) => (Some(namespace), name),
            None => (None, method),
        };

        self.descriptors
            .iter()
            .rev()
            .find(|d| d.name == name && namespace.map_or(true, |ns| d.namespace == ns))
            .filter(|d| {
                // A shadowed descriptor must not resolve
                self.lookup
                    .get(&(d.namespace.clone(), d.verb, d.name.clone()))
                    .map_or(false, |current| Arc::ptr_eq(current, d))
            })
            .cloned()
    }

    /// Build, for every namespace, a read-only map of every *other*
    /// namespace to its API handle, so services can invoke their siblings
    pub fn cross_link(&self) -> HashMap<String, Arc<HashMap<String, Arc<dyn ApiService>>>> {
        self.namespaces
            .iter()
            .map(|namespace| {
                let siblings: HashMap<String, Arc<dyn ApiService>> = self
                    .apis
                    .iter()
                    .filter(|(other, _)| *other != namespace)
                    .map(|(other, api)| (other.clone(), api.clone()))
                    .collect();

                (namespace.clone(), Arc::new(siblings))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_method() -> Arc<dyn Method> {
        method(|_args, _ctx| async { Ok(Outcome::Value(json!(null))) })
    }

    struct FixtureService {
        defs: Vec<MethodDef>,
        ignored: &'static [&'static str],
    }

    impl ApiService for FixtureService {
        fn methods(&self) -> Vec<MethodDef> {
            self.defs.clone()
        }

        fn ignored_methods(&self) -> &'static [&'static str] {
            self.ignored
        }
    }

    fn def(member: &'static str, params: &'static [&'static str]) -> MethodDef {
        MethodDef {
            member,
            params,
            handler: noop_method(),
        }
    }

    #[test]
    fn test_derive_signature_get() {
        let signature = derive_signature("getUserProfile").unwrap();
        assert_eq!(signature.verb, Verb::Get);
        assert_eq!(signature.name, "user-profile");
    }

    #[test]
    fn test_derive_signature_post() {
        let signature = derive_signature("postForumTopic").unwrap();
        assert_eq!(signature.verb, Verb::Post);
        assert_eq!(signature.name, "forum-topic");
    }

    #[test]
    fn test_derive_signature_single_word() {
        let signature = derive_signature("getUsers").unwrap();
        assert_eq!(signature.name, "users");
    }

    #[test]
    fn test_derive_signature_unrecognized_verb() {
        assert!(derive_signature("deleteUser").is_none());
        assert!(derive_signature("fetchUsers").is_none());
    }

    #[test]
    fn test_reserved_and_underscore_arguments_filtered() {
        let filtered = filter_argument_names(&["userId", "session", "_internal", "extra", "limit"]);
        assert_eq!(filtered, vec!["userId", "limit"]);
    }

    #[test]
    fn test_register_api_skips_unrecognized_members() {
        let mut registry = HandlerRegistry::new();
        registry.register_api(
            "user",
            Arc::new(FixtureService {
                defs: vec![
                    def("getProfile", &["userId", "session"]),
                    def("deleteUser", &["userId"]),
                    def("_getSecret", &[]),
                ],
                ignored: &[],
            }),
        );

        let routable = registry.routable();
        assert_eq!(routable.len(), 1);
        assert_eq!(routable[0].name, "profile");
        assert_eq!(routable[0].argument_names, vec!["userId"]);
        assert_eq!(routable[0].route, "/user/profile/:userId");
    }

    #[test]
    fn test_register_api_honors_ignored_methods() {
        let mut registry = HandlerRegistry::new();
        registry.register_api(
            "user",
            Arc::new(FixtureService {
                defs: vec![def("getProfile", &["userId"]), def("getInternal", &[])],
                ignored: &["getInternal"],
            }),
        );

        assert_eq!(registry.routable().len(), 1);
    }

    #[test]
    fn test_post_routes_carry_no_path_arguments() {
        let mut registry = HandlerRegistry::new();
        registry.register_api(
            "forum",
            Arc::new(FixtureService {
                defs: vec![def("postTopic", &["title", "body"])],
                ignored: &[],
            }),
        );

        let routable = registry.routable();
        assert_eq!(routable[0].route, "/forum/topic");
        assert_eq!(routable[0].argument_names, vec!["title", "body"]);
    }

    #[test]
    fn test_reregistration_shadows_in_lookup_but_keeps_both_descriptors() {
        let mut registry = HandlerRegistry::new();
        registry.register_api(
            "user",
            Arc::new(FixtureService {
                defs: vec![def("getProfile", &["userId"])],
                ignored: &[],
            }),
        );
        registry.register_api(
            "user",
            Arc::new(FixtureService {
                defs: vec![def("getProfile", &["userId"])],
                ignored: &[],
            }),
        );

        assert_eq!(registry.descriptors().len(), 2);
        assert_eq!(registry.routable().len(), 1);

        // Route resolution picks the later registration
        let resolved = registry.find_by_method("user.profile").unwrap();
        assert!(Arc::ptr_eq(
            &resolved,
            registry.descriptors().last().unwrap()
        ));
    }

    #[test]
    fn test_find_by_method_with_and_without_namespace() {
        let mut registry = HandlerRegistry::new();
        registry.register_api(
            "user",
            Arc::new(FixtureService {
                defs: vec![def("getProfile", &["userId"])],
                ignored: &[],
            }),
        );

        assert!(registry.find_by_method("user.profile").is_some());
        assert!(registry.find_by_method("profile").is_some());
        assert!(registry.find_by_method("forum.profile").is_none());
        assert!(registry.find_by_method("user.nope").is_none());
    }

    #[test]
    fn test_cross_link_excludes_self() {
        let mut registry = HandlerRegistry::new();
        registry.register_api(
            "user",
            Arc::new(FixtureService {
                defs: vec![def("getProfile", &[])],
                ignored: &[],
            }),
        );
        registry.register_api(
            "forum",
            Arc::new(FixtureService {
                defs: vec![def("getTopics", &[])],
                ignored: &[],
            }),
        );

        let links = registry.cross_link();
        let user_links = links.get("user").unwrap();
        assert!(user_links.contains_key("forum"));
        assert!(!user_links.contains_key("user"));

        let forum_links = links.get("forum").unwrap();
        assert!(forum_links.contains_key("user"));
        assert!(!forum_links.contains_key("forum"));
    }
}
