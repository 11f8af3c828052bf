use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use rand::Rng;

use mrelay_common::{AUTO_GROUP, DEFAULT_GROUP};
use mrelay_storage::{ChannelRow, StorageSnapshot};

#[derive(Debug, Clone)]
struct BandEntry {
    channel_id: i64,
    weight: u32,
}

#[derive(Debug, Clone)]
struct PriorityBand {
    priority: i64,
    entries: Vec<BandEntry>,
}

#[derive(Debug, Default)]
struct AbilityIndex {
    /// (group, model) -> priority bands, highest priority first.
    slots: HashMap<(String, String), Vec<PriorityBand>>,
}

/// In-memory channel/ability registry.
///
/// Readers load an immutable snapshot; rebuilds publish a fresh index with a
/// single atomic swap, so selection never blocks on refresh. Per-channel
/// multi-key cursors live outside the snapshot and survive rebuilds.
pub struct AbilityCache {
    index: ArcSwap<AbilityIndex>,
    channels: ArcSwap<HashMap<i64, Arc<ChannelRow>>>,
    key_cursors: Mutex<HashMap<i64, Arc<AtomicUsize>>>,
}

impl Default for AbilityCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AbilityCache {
    pub fn new() -> Self {
        Self {
            index: ArcSwap::from_pointee(AbilityIndex::default()),
            channels: ArcSwap::from_pointee(HashMap::new()),
            key_cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Swap-on-refresh rebuild from storage rows.
    pub fn rebuild(&self, snapshot: &StorageSnapshot) {
        let mut channels = HashMap::with_capacity(snapshot.channels.len());
        for channel in &snapshot.channels {
            channels.insert(channel.id, Arc::new(channel.clone()));
        }

        let mut grouped: HashMap<(String, String), Vec<(i64, i64, u32)>> = HashMap::new();
        for ability in &snapshot.abilities {
            if !ability.enabled {
                continue;
            }
            let Some(channel) = channels.get(&ability.channel_id) else {
                continue;
            };
            if !channel.status.is_enabled() {
                continue;
            }
            grouped
                .entry((ability.group.clone(), ability.model.clone()))
                .or_default()
                .push((ability.channel_id, ability.priority, ability.weight));
        }

        let mut slots = HashMap::with_capacity(grouped.len());
        for (slot, mut entries) in grouped {
            entries.sort_by(|a, b| b.1.cmp(&a.1));
            let mut bands: Vec<PriorityBand> = Vec::new();
            for (channel_id, priority, weight) in entries {
                match bands.last_mut() {
                    Some(band) if band.priority == priority => {
                        band.entries.push(BandEntry { channel_id, weight });
                    }
                    _ => bands.push(PriorityBand {
                        priority,
                        entries: vec![BandEntry { channel_id, weight }],
                    }),
                }
            }
            slots.insert(slot, bands);
        }

        self.index.store(Arc::new(AbilityIndex { slots }));
        self.channels.store(Arc::new(channels));
    }

    pub fn channel(&self, channel_id: i64) -> Option<Arc<ChannelRow>> {
        self.channels.load().get(&channel_id).cloned()
    }

    /// Fast-path removal after an auto-disable; the next periodic rebuild
    /// reconciles against storage.
    pub fn evict_channel(&self, channel_id: i64) {
        let current = self.index.load_full();
        let mut slots = HashMap::with_capacity(current.slots.len());
        for (slot, bands) in current.slots.iter() {
            let bands: Vec<PriorityBand> = bands
                .iter()
                .filter_map(|band| {
                    let entries: Vec<BandEntry> = band
                        .entries
                        .iter()
                        .filter(|entry| entry.channel_id != channel_id)
                        .cloned()
                        .collect();
                    (!entries.is_empty()).then_some(PriorityBand {
                        priority: band.priority,
                        entries,
                    })
                })
                .collect();
            if !bands.is_empty() {
                slots.insert(slot.clone(), bands);
            }
        }
        self.index.store(Arc::new(AbilityIndex { slots }));
    }

    /// Pick a channel for `(group, model)` honouring priority bands, weighted
    /// random within a band, and the caller's tried-set.
    ///
    /// `retry_index` 0 selects the top band, k the k-th lower one. Past the
    /// last band the whole slot minus `tried` becomes the candidate pool.
    pub fn select(
        &self,
        group: &str,
        model: &str,
        retry_index: u32,
        tried: &HashSet<i64>,
    ) -> Option<Arc<ChannelRow>> {
        let group = resolve_group(group);
        let index = self.index.load_full();
        let bands = index.slots.get(&(group.to_string(), model.to_string()))?;
        if bands.is_empty() {
            return None;
        }

        let candidates: Vec<&BandEntry> = if (retry_index as usize) < bands.len() {
            bands[retry_index as usize]
                .entries
                .iter()
                .filter(|entry| !tried.contains(&entry.channel_id))
                .collect()
        } else {
            bands
                .iter()
                .flat_map(|band| band.entries.iter())
                .filter(|entry| !tried.contains(&entry.channel_id))
                .collect()
        };
        if candidates.is_empty() {
            return None;
        }

        let index = pick_weighted(&candidates);
        self.channel(candidates[index].channel_id)
    }

    /// Distinct model names served for a group, for `GET /v1/models`.
    pub fn models_for_group(&self, group: &str) -> Vec<String> {
        let group = resolve_group(group);
        let index = self.index.load();
        let mut models: Vec<String> = index
            .slots
            .keys()
            .filter(|(g, _)| g == group)
            .map(|(_, model)| model.clone())
            .collect();
        models.sort();
        models.dedup();
        models
    }

    /// Round-robin cursor over the channel's credential list.
    pub fn next_key(&self, channel: &ChannelRow) -> String {
        if channel.keys.len() <= 1 {
            return channel.keys.first().cloned().unwrap_or_default();
        }
        let cursor = {
            let mut cursors = self.key_cursors.lock().expect("key cursors poisoned");
            cursors
                .entry(channel.id)
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
                .clone()
        };
        let next = cursor.fetch_add(1, Ordering::Relaxed);
        channel.keys[next % channel.keys.len()].clone()
    }
}

/// Tokens tagged "auto" route through the user's default tier.
pub fn resolve_group(group: &str) -> &str {
    if group.is_empty() || group == AUTO_GROUP {
        DEFAULT_GROUP
    } else {
        group
    }
}

/// Probability proportional to `max(weight, 1)`, so zero-weight entries stay
/// selectable and an all-zero band degenerates to uniform random.
fn pick_weighted(entries: &[&BandEntry]) -> usize {
    let weights: Vec<u64> = entries
        .iter()
        .map(|entry| u64::from(entry.weight.max(1)))
        .collect();
    let total: u64 = weights.iter().sum();
    let mut roll = rand::rng().random_range(0..total);
    for (index, weight) in weights.iter().enumerate() {
        if roll < *weight {
            return index;
        }
        roll -= weight;
    }
    entries.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrelay_common::{ChannelKind, ChannelStatus};
    use mrelay_storage::{AbilityRow, ChannelSetting};

    fn channel(id: i64, priority: i64, weight: u32) -> ChannelRow {
        ChannelRow {
            id,
            name: format!("ch-{id}"),
            kind: ChannelKind::OpenAI,
            keys: vec![format!("sk-{id}")],
            base_url: None,
            models: vec!["gpt-4o".to_string()],
            groups: vec!["default".to_string()],
            model_mapping: Default::default(),
            priority,
            weight,
            status: ChannelStatus::Enabled,
            auto_ban: true,
            status_code_mapping: None,
            setting: ChannelSetting::default(),
        }
    }

    fn snapshot(channels: Vec<ChannelRow>) -> StorageSnapshot {
        let abilities = channels
            .iter()
            .map(|c| AbilityRow {
                group: "default".to_string(),
                model: "gpt-4o".to_string(),
                channel_id: c.id,
                enabled: true,
                priority: c.priority,
                weight: c.weight,
            })
            .collect();
        StorageSnapshot {
            channels,
            abilities,
        }
    }

    #[test]
    fn retry_index_walks_priority_bands() {
        let cache = AbilityCache::new();
        cache.rebuild(&snapshot(vec![
            channel(1, 10, 1),
            channel(2, 10, 1),
            channel(3, 0, 1),
        ]));

        let tried = HashSet::new();
        for _ in 0..20 {
            let picked = cache.select("default", "gpt-4o", 0, &tried).unwrap();
            assert!(picked.priority == 10, "band 0 is the top priority");
        }
        let picked = cache.select("default", "gpt-4o", 1, &tried).unwrap();
        assert_eq!(picked.id, 3, "band 1 is the next distinct priority");
    }

    #[test]
    fn exhausted_bands_fall_back_to_untried_channels() {
        let cache = AbilityCache::new();
        cache.rebuild(&snapshot(vec![channel(1, 10, 1), channel(2, 0, 1)]));

        let mut tried = HashSet::new();
        tried.insert(1);
        let picked = cache.select("default", "gpt-4o", 5, &tried).unwrap();
        assert_eq!(picked.id, 2);

        tried.insert(2);
        assert!(cache.select("default", "gpt-4o", 5, &tried).is_none());
    }

    #[test]
    fn tried_channels_are_excluded_within_a_band() {
        let cache = AbilityCache::new();
        cache.rebuild(&snapshot(vec![channel(1, 0, 1), channel(2, 0, 1)]));

        let mut tried = HashSet::new();
        tried.insert(1);
        for _ in 0..10 {
            let picked = cache.select("default", "gpt-4o", 0, &tried).unwrap();
            assert_eq!(picked.id, 2);
        }
    }

    #[test]
    fn weighted_selection_tracks_weights() {
        let cache = AbilityCache::new();
        cache.rebuild(&snapshot(vec![channel(1, 0, 9), channel(2, 0, 1)]));

        let tried = HashSet::new();
        let mut hits = [0u32; 2];
        for _ in 0..2000 {
            match cache.select("default", "gpt-4o", 0, &tried).unwrap().id {
                1 => hits[0] += 1,
                2 => hits[1] += 1,
                _ => unreachable!(),
            }
        }
        let share = hits[0] as f64 / 2000.0;
        assert!(share > 0.8 && share < 0.98, "share was {share}");
    }

    #[test]
    fn zero_weights_degenerate_to_uniform() {
        let cache = AbilityCache::new();
        cache.rebuild(&snapshot(vec![channel(1, 0, 0), channel(2, 0, 0)]));

        let tried = HashSet::new();
        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(cache.select("default", "gpt-4o", 0, &tried).unwrap().id);
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn auto_group_resolves_to_default() {
        let cache = AbilityCache::new();
        cache.rebuild(&snapshot(vec![channel(1, 0, 1)]));
        let tried = HashSet::new();
        assert!(cache.select("auto", "gpt-4o", 0, &tried).is_some());
    }

    #[test]
    fn disabled_channels_never_enter_the_index() {
        let cache = AbilityCache::new();
        let mut disabled = channel(1, 0, 1);
        disabled.status = ChannelStatus::AutoDisabled;
        cache.rebuild(&snapshot(vec![disabled, channel(2, 0, 1)]));
        let tried = HashSet::new();
        for _ in 0..10 {
            assert_eq!(cache.select("default", "gpt-4o", 0, &tried).unwrap().id, 2);
        }
    }

    #[test]
    fn evict_channel_takes_effect_immediately() {
        let cache = AbilityCache::new();
        cache.rebuild(&snapshot(vec![channel(1, 0, 1)]));
        cache.evict_channel(1);
        let tried = HashSet::new();
        assert!(cache.select("default", "gpt-4o", 0, &tried).is_none());
    }

    #[test]
    fn multi_key_round_robin_cycles() {
        let cache = AbilityCache::new();
        let mut multi = channel(1, 0, 1);
        multi.keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let keys: Vec<String> = (0..6).map(|_| cache.next_key(&multi)).collect();
        assert_eq!(keys, ["a", "b", "c", "a", "b", "c"]);
    }
}
