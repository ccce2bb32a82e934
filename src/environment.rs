use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Variable through which node CLI commands locate and authenticate to the node.
pub const API_INFO_VAR: &str = "FULLNODE_API_INFO";

/// Variable carrying the raw admin token to test commands.
pub const ADMIN_TOKEN_VAR: &str = "ADMIN_TOKEN";

/// Environment variables handed to a child command.
///
/// Child commands only ever see what is set here on top of the inherited
/// process environment; the harness never exports anything into its own
/// environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment(HashMap<String, String>);

impl Environment {
    /// Creates a new empty environment variable set.
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Sets a variable, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder form of [`Environment::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Merges `other` into this set; values from `other` win.
    pub fn extend(&mut self, other: Environment) {
        self.0.extend(other.0);
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<HashMap<String, String>> for Environment {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

/// Where the node serves its RPC API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiEndpoint {
    pub host: IpAddr,
    pub port: u16,
}

impl Default for ApiEndpoint {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 2345,
        }
    }
}

impl ApiEndpoint {
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self { host, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Multiaddress form of the endpoint, e.g. `/ip4/127.0.0.1/tcp/2345/http`.
    pub fn multiaddr(&self) -> String {
        let proto = match self.host {
            IpAddr::V4(_) => "ip4",
            IpAddr::V6(_) => "ip6",
        };
        format!("/{}/{}/tcp/{}/http", proto, self.host, self.port)
    }

    /// Composes the `<token>:<multiaddr>` string node CLIs expect.
    pub fn api_info(&self, token: &str) -> String {
        format!("{}:{}", token, self.multiaddr())
    }
}

/// Values available to the test body once the node reports ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEnv {
    pub token: String,
    pub api_info: String,
}

impl NodeEnv {
    pub fn new(token: impl Into<String>, endpoint: &ApiEndpoint) -> Self {
        let token = token.into();
        let api_info = endpoint.api_info(&token);
        Self { token, api_info }
    }

    /// Variables a node CLI needs to talk to this instance.
    pub fn cli_environment(&self) -> Environment {
        Environment::new().with(API_INFO_VAR, self.api_info.clone())
    }

    /// Variables exported to an external test command.
    pub fn test_environment(&self) -> Environment {
        self.cli_environment()
            .with(ADMIN_TOKEN_VAR, self.token.clone())
    }
}
