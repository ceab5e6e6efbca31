//! Request routing across the brokers of one cluster
//!
//! A [`KafkaCluster`] starts from a bootstrap connection and opens one
//! [`KafkaClient`] per broker it needs to reach. Partition requests go to the
//! partition leader, group requests to the group coordinator. Leaders and
//! coordinators are cached until a broker reports that they moved.

use anyhow::{anyhow, Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::kafka_client::{broker_error_code, KafkaClient, TopicRoute};

/// Error codes after which a cached partition leader must be looked up again
const STALE_LEADER_CODES: [i16; 3] = [3, 5, 6];

/// Error codes after which a cached group coordinator must be looked up again
const STALE_COORDINATOR_CODES: [i16; 2] = [15, 16];

#[derive(Default)]
struct Routes {
    /// Broker id to "host:port"
    addresses: HashMap<i32, String>,
    /// (topic, partition) to leader broker id
    leaders: HashMap<(String, i32), i32>,
    /// Group id to coordinator broker id
    coordinators: HashMap<String, i32>,
}

/// Connections to every broker one session talks to
pub struct KafkaCluster {
    bootstrap: Arc<KafkaClient>,
    client_id: String,
    io_timeout: Duration,
    nodes: Mutex<HashMap<i32, Arc<KafkaClient>>>,
    routes: Mutex<Routes>,
}

impl KafkaCluster {
    /// Connects to the first reachable bootstrap broker
    pub async fn connect(bootstrap: &[String], client_id: &str, io_timeout: Duration) -> Result<Self> {
        let client = KafkaClient::connect(bootstrap, client_id, io_timeout).await?;
        Ok(Self {
            bootstrap: Arc::new(client),
            client_id: client_id.to_string(),
            io_timeout,
            nodes: Mutex::new(HashMap::new()),
            routes: Mutex::new(Routes::default()),
        })
    }

    /// Refreshes the leaders of `topic` and returns its partition ids, sorted
    pub async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        let route = self.bootstrap.topic_route(topic).await?;
        let partitions = route.leaders.keys().copied().collect();
        self.remember(topic, route).await;
        Ok(partitions)
    }

    async fn remember(&self, topic: &str, route: TopicRoute) {
        let mut routes = self.routes.lock().await;
        routes.addresses.extend(route.brokers);
        routes.leaders.retain(|(t, _), _| t != topic);
        for (partition, leader) in route.leaders {
            if leader >= 0 {
                routes.leaders.insert((topic.to_string(), partition), leader);
            }
        }
    }

    async fn leader_id(&self, topic: &str, partition: i32) -> Result<i32> {
        let key = (topic.to_string(), partition);
        if let Some(leader) = self.routes.lock().await.leaders.get(&key) {
            return Ok(*leader);
        }
        self.partitions(topic).await?;
        self.routes
            .lock()
            .await
            .leaders
            .get(&key)
            .copied()
            .ok_or_else(|| anyhow!("{}[{}] has no leader yet", topic, partition))
    }

    /// Client connected to the current leader of `topic[partition]`
    pub async fn leader(&self, topic: &str, partition: i32) -> Result<Arc<KafkaClient>> {
        let leader = self.leader_id(topic, partition).await?;
        self.node(leader).await
    }

    /// Splits per-partition work by the broker leading each partition
    pub async fn by_leader<T>(
        &self,
        items: Vec<(String, i32, T)>,
    ) -> Result<Vec<(Arc<KafkaClient>, Vec<(String, i32, T)>)>> {
        let mut grouped: BTreeMap<i32, Vec<(String, i32, T)>> = BTreeMap::new();
        for (topic, partition, item) in items {
            let leader = self.leader_id(&topic, partition).await?;
            grouped.entry(leader).or_default().push((topic, partition, item));
        }
        let mut routed = Vec::with_capacity(grouped.len());
        for (leader, items) in grouped {
            routed.push((self.node(leader).await?, items));
        }
        Ok(routed)
    }

    /// Client connected to the coordinator of `group`
    pub async fn coordinator(&self, group: &str) -> Result<Arc<KafkaClient>> {
        let cached = self.routes.lock().await.coordinators.get(group).copied();
        let node = match cached {
            Some(node) => node,
            None => {
                let (node, address) = self
                    .bootstrap
                    .find_coordinator(group)
                    .await
                    .with_context(|| format!("no coordinator for group '{}'", group))?;
                debug!("Group '{}' is coordinated by broker {} at {}", group, node, address);
                let mut routes = self.routes.lock().await;
                routes.addresses.insert(node, address);
                routes.coordinators.insert(group.to_string(), node);
                node
            }
        };
        self.node(node).await
    }

    async fn node(&self, id: i32) -> Result<Arc<KafkaClient>> {
        let mut nodes = self.nodes.lock().await;
        if let Some(client) = nodes.get(&id) {
            return Ok(client.clone());
        }
        let address = self
            .routes
            .lock()
            .await
            .addresses
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("address of broker {} is unknown", id))?;
        let client = Arc::new(
            KafkaClient::connect(&[address], &self.client_id, self.io_timeout)
                .await
                .with_context(|| format!("broker {} unreachable", id))?,
        );
        nodes.insert(id, client.clone());
        Ok(client)
    }

    /// Drops cached routes that `err` shows to be out of date
    pub async fn invalidate(&self, err: &anyhow::Error, topic: Option<(&str, i32)>, group: Option<&str>) {
        let Some(code) = broker_error_code(err) else {
            return;
        };
        let mut routes = self.routes.lock().await;
        if let Some((topic, partition)) = topic {
            if STALE_LEADER_CODES.contains(&code) {
                debug!("Forgetting leader of {}[{}]", topic, partition);
                routes.leaders.remove(&(topic.to_string(), partition));
            }
        }
        if let Some(group) = group {
            if STALE_COORDINATOR_CODES.contains(&code) {
                debug!("Forgetting coordinator of group '{}'", group);
                routes.coordinators.remove(group);
            }
        }
    }

    /// Waits until no connection has an exchange in flight, bounded by `wait` overall
    pub async fn drain(&self, wait: Duration) -> Result<()> {
        let deadline = Instant::now() + wait;
        let mut clients = vec![self.bootstrap.clone()];
        clients.extend(self.nodes.lock().await.values().cloned());
        for client in clients {
            client
                .drain(deadline.saturating_duration_since(Instant::now()))
                .await?;
        }
        Ok(())
    }

    /// Closes every connection; closing continues past individual failures
    pub async fn close(&self) -> Result<()> {
        let mut first_error = self.bootstrap.close().await.err();
        let nodes: Vec<_> = self.nodes.lock().await.drain().map(|(_, c)| c).collect();
        for client in nodes {
            if let Err(e) = client.close().await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::kafka_client::BrokerError;

    #[tokio::test]
    async fn test_connect_fails_without_broker() {
        let result = KafkaCluster::connect(&["127.0.0.1:1".into()], "c-test", Duration::from_millis(200)).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_stale_route_codes() {
        let not_leader: anyhow::Error = BrokerError {
            operation: "produce to t[0]".into(),
            code: 6,
        }
        .into();
        assert_eq!(broker_error_code(&not_leader), Some(6));
        assert!(STALE_LEADER_CODES.contains(&6));
        assert!(STALE_COORDINATOR_CODES.contains(&16));
        assert_eq!(broker_error_code(&anyhow!("socket closed")), None);
        assert_eq!(not_leader.to_string(), "produce to t[0] failed: NOT_LEADER_OR_FOLLOWER");
    }
}
