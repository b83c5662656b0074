//! The name-keyed set of proxies. Guards the map with a read-write lock and
//! hands out defensive snapshots so callers iterate without holding it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::ProxyInput;
use crate::error::Error;
use crate::proxy::{Proxy, ProxyConfig};
use crate::toxic::Toxic;

pub struct ProxyCollection {
    seed: u64,
    proxies: RwLock<HashMap<String, Arc<Proxy>>>,
}

impl ProxyCollection {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            proxies: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a new proxy, optionally starting it right away. Duplicate
    /// names and bind failures leave the collection untouched.
    pub async fn add(&self, config: ProxyConfig) -> Result<Arc<Proxy>, Error> {
        let mut proxies = self.proxies.write().await;
        Self::add_locked(&mut proxies, self.seed, config)
    }

    fn add_locked(
        proxies: &mut HashMap<String, Arc<Proxy>>,
        seed: u64,
        config: ProxyConfig,
    ) -> Result<Arc<Proxy>, Error> {
        if proxies.contains_key(&config.name) {
            return Err(Error::ProxyAlreadyExists);
        }

        let proxy = Arc::new(Proxy::new(config.name.clone(), config.listen, config.upstream, seed));
        if config.enabled {
            proxy.start()?;
        }
        proxies.insert(config.name, Arc::clone(&proxy));
        Ok(proxy)
    }

    /// Registers a proxy, replacing an existing one by the same name unless
    /// its listen and upstream addresses already match — in that case the
    /// existing proxy (and its live connections) is left untouched.
    pub async fn add_or_replace(&self, config: ProxyConfig) -> Result<Arc<Proxy>, Error> {
        let mut proxies = self.proxies.write().await;
        Self::add_or_replace_locked(&mut proxies, self.seed, config).await
    }

    async fn add_or_replace_locked(
        proxies: &mut HashMap<String, Arc<Proxy>>,
        seed: u64,
        config: ProxyConfig,
    ) -> Result<Arc<Proxy>, Error> {
        if let Some(existing) = proxies.get(&config.name) {
            if existing.listen_addr() == config.listen && existing.upstream_addr() == config.upstream {
                return Ok(Arc::clone(existing));
            }
        }
        if let Some(existing) = proxies.remove(&config.name) {
            existing.stop().await;
        }

        Self::add_locked(proxies, seed, config)
    }

    pub async fn get(&self, name: &str) -> Result<Arc<Proxy>, Error> {
        let proxies = self.proxies.read().await;
        proxies.get(name).map(Arc::clone).ok_or(Error::ProxyNotFound)
    }

    pub async fn remove(&self, name: &str) -> Result<(), Error> {
        let removed = {
            let mut proxies = self.proxies.write().await;
            proxies.remove(name).ok_or(Error::ProxyNotFound)?
        };
        removed.stop().await;
        Ok(())
    }

    /// Snapshot of every registered proxy.
    pub async fn proxies(&self) -> Vec<Arc<Proxy>> {
        let proxies = self.proxies.read().await;
        let mut snapshot: Vec<Arc<Proxy>> = proxies.values().map(Arc::clone).collect();
        snapshot.sort_by(|a, b| a.name().cmp(b.name()));
        snapshot
    }

    /// Stops and forgets every proxy.
    pub async fn clear(&self) {
        let drained: Vec<Arc<Proxy>> = {
            let mut proxies = self.proxies.write().await;
            proxies.drain().map(|(_, proxy)| proxy).collect()
        };
        for proxy in drained {
            proxy.stop().await;
        }
    }

    /// Re-enables every stopped proxy and removes all toxics everywhere.
    pub async fn reset_state(&self) -> Result<(), Error> {
        for proxy in self.proxies().await {
            match proxy.start() {
                Ok(()) | Err(Error::ProxyAlreadyStarted) => {}
                Err(error) => return Err(error),
            }
            proxy.toxics().reset().await;
        }
        Ok(())
    }

    /// Applies a batch of proxy definitions under the collection lock:
    /// removes proxies absent from the batch, creates or replaces the rest,
    /// and reconciles their toxics. Each per-proxy step is atomic; on the
    /// first failing entry the error is returned with earlier entries left
    /// applied.
    pub async fn populate(&self, entries: Vec<ProxyInput>) -> Result<Vec<Arc<Proxy>>, Error> {
        // Validate the whole batch before touching anything.
        for (index, entry) in entries.iter().enumerate() {
            if entry.name.is_empty() {
                return Err(Error::MissingField(format!("name at proxy {}", index + 1)));
            }
            if entry.upstream.is_empty() {
                return Err(Error::MissingField(format!("upstream at proxy {}", index + 1)));
            }
        }

        let mut proxies = self.proxies.write().await;

        let keep: HashSet<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        let stale: Vec<String> = proxies
            .keys()
            .filter(|name| !keep.contains(name.as_str()))
            .cloned()
            .collect();
        for name in stale {
            if let Some(proxy) = proxies.remove(&name) {
                info!(proxy = %name, "removing proxy absent from populate batch");
                proxy.stop().await;
            }
        }

        let mut applied = Vec::with_capacity(entries.len());
        for entry in entries {
            let config = ProxyConfig {
                name: entry.name.clone(),
                listen: entry.listen_or_default(),
                upstream: entry.upstream.clone(),
                enabled: entry.enabled.unwrap_or(true),
            };
            let proxy = Self::add_or_replace_locked(&mut proxies, self.seed, config).await?;
            reconcile_toxics(&proxy, entry.toxics).await?;
            applied.push(proxy);
        }

        Ok(applied)
    }
}

/// Brings a proxy's toxics in line with the desired set: missing toxics are
/// added and any whose full configuration differs is recreated so live
/// connections pick up the new definition.
async fn reconcile_toxics(proxy: &Proxy, inputs: Vec<crate::toxic::ToxicInput>) -> Result<(), Error> {
    let desired: Vec<Toxic> = inputs
        .into_iter()
        .map(Toxic::from_input)
        .collect::<Result<_, _>>()?;

    let current = proxy.toxics().list().await;
    for toxic in desired {
        match current.iter().find(|existing| existing.name == toxic.name) {
            None => {
                proxy.toxics().add(toxic).await?;
            }
            Some(existing) if !existing.config_matches(&toxic) => {
                proxy.toxics().remove(&toxic.name).await?;
                proxy.toxics().add(toxic).await?;
            }
            Some(_) => {}
        }
    }

    Ok(())
}
