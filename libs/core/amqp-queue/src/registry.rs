//! Topic-keyed registry of consuming channels.

use std::collections::HashMap;
use tokio::sync::RwLock;

/// One registered consumer and its tag.
#[derive(Debug)]
pub struct Registered<C> {
    pub tag: String,
    pub consumer: C,
}

/// Channels per queue, in subscription order.
///
/// Tags are `{queue}_{n}` where `n` counts every tag ever reserved for the
/// queue, so a tag is never handed out twice even after channels are removed.
#[derive(Debug)]
pub struct ChannelRegistry<C> {
    channels: RwLock<Channels<C>>,
}

#[derive(Debug)]
struct Channels<C> {
    by_queue: HashMap<String, Vec<Registered<C>>>,
    issued: HashMap<String, usize>,
}

impl<C> Default for ChannelRegistry<C> {
    fn default() -> Self {
        Self {
            channels: RwLock::new(Channels {
                by_queue: HashMap::new(),
                issued: HashMap::new(),
            }),
        }
    }
}

impl<C> ChannelRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next consumer tag for `queue`.
    pub async fn next_tag(&self, queue: &str) -> String {
        let mut channels = self.channels.write().await;
        let issued = channels.issued.entry(queue.to_string()).or_default();
        *issued += 1;
        format!("{}_{}", queue, issued)
    }

    pub async fn register(&self, queue: &str, tag: String, consumer: C) {
        self.channels
            .write()
            .await
            .by_queue
            .entry(queue.to_string())
            .or_default()
            .push(Registered { tag, consumer });
    }

    /// Remove the first `n` channels of `queue`; all of them when `n` covers
    /// the list.
    pub async fn take(&self, queue: &str, n: usize) -> Vec<Registered<C>> {
        let mut channels = self.channels.write().await;
        let Some(list) = channels.by_queue.get_mut(queue) else {
            return Vec::new();
        };

        if n >= list.len() {
            return channels.by_queue.remove(queue).unwrap_or_default();
        }
        list.drain(..n).collect()
    }

    /// Remove everything, grouped by queue.
    pub async fn take_all(&self) -> Vec<(String, Vec<Registered<C>>)> {
        self.channels.write().await.by_queue.drain().collect()
    }

    pub async fn tags(&self, queue: &str) -> Vec<String> {
        self.channels
            .read()
            .await
            .by_queue
            .get(queue)
            .map(|list| list.iter().map(|r| r.tag.clone()).collect())
            .unwrap_or_default()
    }

    /// Tags of the channels for which `unhealthy` returns true.
    pub async fn find_tags(&self, unhealthy: impl Fn(&C) -> bool) -> Vec<String> {
        let mut tags: Vec<String> = self
            .channels
            .read()
            .await
            .by_queue
            .values()
            .flatten()
            .filter(|r| unhealthy(&r.consumer))
            .map(|r| r.tag.clone())
            .collect();
        tags.sort();
        tags
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.by_queue.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry_with(queue: &str, n: usize) -> ChannelRegistry<bool> {
        let registry = ChannelRegistry::new();
        for _ in 0..n {
            let tag = registry.next_tag(queue).await;
            registry.register(queue, tag, true).await;
        }
        registry
    }

    #[tokio::test]
    async fn test_tags_follow_subscription_order() {
        let registry = registry_with("orders", 3).await;
        assert_eq!(registry.tags("orders").await, vec!["orders_1", "orders_2", "orders_3"]);
        assert_eq!(registry.next_tag("billing").await, "billing_1");
    }

    #[tokio::test]
    async fn test_take_removes_first_n() {
        let registry = registry_with("orders", 3).await;

        let removed = registry.take("orders", 2).await;
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].tag, "orders_1");
        assert_eq!(registry.tags("orders").await, vec!["orders_3"]);
    }

    #[tokio::test]
    async fn test_tags_not_reused_after_take() {
        let registry = registry_with("orders", 2).await;
        registry.take("orders", 1).await;

        let tag = registry.next_tag("orders").await;
        registry.register("orders", tag, true).await;
        assert_eq!(registry.tags("orders").await, vec!["orders_2", "orders_3"]);

        registry.take("orders", 5).await;
        assert_eq!(registry.next_tag("orders").await, "orders_4");
    }

    #[tokio::test]
    async fn test_concurrent_reservations_are_distinct() {
        let registry = std::sync::Arc::new(ChannelRegistry::<bool>::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.next_tag("orders").await })
            })
            .collect();

        let mut tags = Vec::new();
        for handle in handles {
            tags.push(handle.await.unwrap());
        }
        tags.sort();
        tags.dedup();
        assert_eq!(tags.len(), 8);
    }

    #[tokio::test]
    async fn test_take_more_than_registered_removes_queue() {
        let registry = registry_with("orders", 2).await;

        assert_eq!(registry.take("orders", 5).await.len(), 2);
        assert!(registry.is_empty().await);
        assert!(registry.take("missing", 1).await.is_empty());
    }

    #[tokio::test]
    async fn test_find_tags_and_take_all() {
        let registry = registry_with("orders", 2).await;
        registry.register("billing", "billing_1".to_string(), false).await;

        assert_eq!(registry.find_tags(|healthy| !healthy).await, vec!["billing_1"]);
        assert_eq!(registry.len().await, 3);

        let all = registry.take_all().await;
        assert_eq!(all.len(), 2);
        assert!(registry.is_empty().await);
    }
}
