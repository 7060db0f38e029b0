///! Memcached-backed cache client.
///!
///! Mirrors the `<cache>` section of the host settings config, which
///! may define more than one named cache (e.g. "global" for
///! long-lived, authenticated data and "anon" for short-lived,
///! unauthenticated data).  Only one cache is "active" on a given
///! `Cache` value at a time; switch with `set_active_type()`.
use super::sclient::HostSettings;
use std::collections::HashMap;
use std::sync::Arc;

const DEFAULT_TIMEOUT: u32 = 0;
const DEFAULT_CACHE_TYPE: &str = "global";

struct CacheConnection {
    client: memcache::Client,
    max_cache_time: u32,
}

pub struct Cache {
    host_settings: Arc<HostSettings>,
    connections: HashMap<String, CacheConnection>,
    active_type: String,
}

impl Cache {
    /// Connects to the default ("global") cache using the servers
    /// listed under `cache/global/servers/server` in the host settings.
    pub fn init(host_settings: Arc<HostSettings>) -> Result<Cache, String> {
        let mut cache = Cache {
            host_settings,
            connections: HashMap::new(),
            active_type: DEFAULT_CACHE_TYPE.to_string(),
        };

        cache.connect(DEFAULT_CACHE_TYPE)?;

        Ok(cache)
    }

    /// Switch the active cache to a different configured type,
    /// connecting to it on first use.
    ///
    /// Returns Err if no settings exist for the requested cache type.
    pub fn set_active_type(&mut self, cache_type: &str) -> Result<(), String> {
        if !self.connections.contains_key(cache_type) {
            self.connect(cache_type)?;
        }

        self.active_type = cache_type.to_string();

        Ok(())
    }

    fn connect(&mut self, cache_type: &str) -> Result<(), String> {
        let config = self.host_settings.value(&format!("cache/{cache_type}"));

        if config.is_null() {
            return Err(format!("No cache settings found for type '{cache_type}'"));
        }

        let mut servers = Vec::new();
        let server_node = &config["servers"]["server"];

        if let Some(server) = server_node.as_str() {
            servers.push(format!("memcache://{server}"));
        } else {
            for server in server_node.members() {
                if let Some(s) = server.as_str() {
                    servers.push(format!("memcache://{s}"));
                }
            }
        }

        if servers.is_empty() {
            return Err(format!("Cache type '{cache_type}' has no servers configured"));
        }

        let max_cache_time = config["max_cache_time"]
            .as_u32()
            .unwrap_or(DEFAULT_TIMEOUT);

        log::info!("cache: connecting to '{cache_type}' servers {servers:?}");

        let client = memcache::connect(servers)
            .or_else(|e| Err(format!("Error connecting to cache '{cache_type}': {e}")))?;

        self.connections.insert(
            cache_type.to_string(),
            CacheConnection {
                client,
                max_cache_time,
            },
        );

        Ok(())
    }

    fn active(&self) -> &CacheConnection {
        // set_active_type() and init() guarantee an entry exists for
        // the active type.
        self.connections.get(&self.active_type).unwrap()
    }

    /// Store a value in the active cache.
    ///
    /// A timeout of None uses the configured max_cache_time for this
    /// cache type.
    pub fn set(
        &mut self,
        key: &str,
        value: &json::JsonValue,
        timeout: Option<u32>,
    ) -> Result<(), String> {
        let conn = self.active();
        let timeout = timeout.unwrap_or(conn.max_cache_time);
        let json_str = value.dump();

        log::debug!("cache: {} => {json_str}", key);

        conn.client
            .set(key, json_str.as_str(), timeout)
            .or_else(|e| Err(format!("Error setting cache value for '{key}': {e}")))
    }

    /// Fetch a value from the active cache, returning None if the key
    /// is not present.
    pub fn get(&self, key: &str) -> Result<Option<json::JsonValue>, String> {
        let value: Option<String> = self
            .active()
            .client
            .get(key)
            .or_else(|e| Err(format!("Error fetching cache value for '{key}': {e}")))?;

        let value = match value {
            Some(v) => v,
            None => return Ok(None),
        };

        log::debug!("cache: fetched {key} => {value}");

        let parsed = json::parse(&value)
            .or_else(|e| Err(format!("Error parsing cached JSON for '{key}': {e}")))?;

        if parsed.is_null() {
            Ok(None)
        } else {
            Ok(Some(parsed))
        }
    }

    /// Remove a value from the active cache.
    pub fn del(&mut self, key: &str) -> Result<(), String> {
        log::debug!("cache: deleting {key}");

        self.active()
            .client
            .delete(key)
            .map(|_| ())
            .or_else(|e| Err(format!("Error deleting cache value for '{key}': {e}")))
    }
}
