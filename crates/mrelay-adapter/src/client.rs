use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use wreq::Proxy;

use crate::error::{AdapterError, AdapterResult};

static CLIENTS: RwLock<Option<HashMap<Option<String>, Arc<wreq::Client>>>> = RwLock::new(None);

/// One shared client per egress proxy (channels may each carry their own
/// `setting.proxy`). Connection pools are reused across requests.
pub fn shared_client(proxy: Option<&str>) -> AdapterResult<Arc<wreq::Client>> {
    let key = proxy.map(|value| value.to_string());

    if let Ok(guard) = CLIENTS.read()
        && let Some(clients) = guard.as_ref()
        && let Some(client) = clients.get(&key)
    {
        return Ok(client.clone());
    }

    let mut builder = wreq::Client::builder();
    if let Some(proxy_url) = proxy {
        let proxy = Proxy::all(proxy_url)
            .map_err(|err| AdapterError::InvalidConfig(format!("bad proxy url: {err}")))?;
        builder = builder.proxy(proxy);
    }
    let client = Arc::new(
        builder
            .build()
            .map_err(|err| AdapterError::Network(err.to_string()))?,
    );

    let mut guard = CLIENTS
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let clients = guard.get_or_insert_with(HashMap::new);
    let entry = clients.entry(key).or_insert_with(|| client.clone());
    Ok(entry.clone())
}
