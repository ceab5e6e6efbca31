//! Consumer group membership over the classic Kafka group protocol
//!
//! A [`GroupMember`] joins its group through the coordinator, and when elected
//! leader it computes the partition assignment for everyone. It heartbeats from
//! the poll path and rejoins when the coordinator announces a rebalance, so
//! members of one group split partitions between them instead of each reading
//! everything.

use anyhow::{anyhow, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use kafka_protocol::messages::consumer_protocol_assignment::{
    ConsumerProtocolAssignment, TopicPartition,
};
use kafka_protocol::messages::consumer_protocol_subscription::ConsumerProtocolSubscription;
use kafka_protocol::messages::TopicName;
use kafka_protocol::protocol::{Decodable, Encodable, StrBytes};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::kafka_client::broker_error_code;
use super::kafka_cluster::KafkaCluster;

/// Assignment strategy name announced in JoinGroup
pub const ASSIGNMENT_STRATEGY: &str = "roundrobin";

/// Highest consumer-protocol version this client decodes
const PROTOCOL_VERSION_MAX: i16 = 3;

const SESSION_TIMEOUT: Duration = Duration::from_secs(30);
const REBALANCE_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

const ILLEGAL_GENERATION: i16 = 22;
const UNKNOWN_MEMBER_ID: i16 = 25;
const REBALANCE_IN_PROGRESS: i16 = 27;

/// Partitions per topic owned by one member
pub type Assignment = BTreeMap<String, Vec<i32>>;

/// Encodes the topics a member subscribes to as JoinGroup protocol metadata
pub fn encode_subscription(topics: &[String]) -> Result<Bytes> {
    let mut subscription = ConsumerProtocolSubscription::default();
    subscription.topics = topics
        .iter()
        .map(|t| StrBytes::from_string(t.clone()))
        .collect();

    let mut buf = BytesMut::new();
    buf.put_i16(0);
    subscription
        .encode(&mut buf, 0)
        .map_err(|e| anyhow!("Failed to encode group subscription: {}", e))?;
    Ok(buf.freeze())
}

pub fn decode_subscription(metadata: &Bytes) -> Result<Vec<String>> {
    let (version, mut body) = split_version(metadata)?;
    let subscription = ConsumerProtocolSubscription::decode(&mut body, version)
        .map_err(|e| anyhow!("Failed to decode group subscription: {}", e))?;
    Ok(subscription.topics.iter().map(|t| t.to_string()).collect())
}

pub fn encode_assignment(assignment: &Assignment) -> Result<Bytes> {
    let mut encoded = ConsumerProtocolAssignment::default();
    encoded.assigned_partitions = assignment
        .iter()
        .map(|(topic, partitions)| {
            let mut entry = TopicPartition::default();
            entry.topic = TopicName(StrBytes::from_string(topic.clone()));
            entry.partitions = partitions.clone();
            entry
        })
        .collect();

    let mut buf = BytesMut::new();
    buf.put_i16(0);
    encoded
        .encode(&mut buf, 0)
        .map_err(|e| anyhow!("Failed to encode group assignment: {}", e))?;
    Ok(buf.freeze())
}

/// Decodes a SyncGroup assignment; an empty blob means no partitions
pub fn decode_assignment(bytes: &Bytes) -> Result<Assignment> {
    if bytes.is_empty() {
        return Ok(Assignment::new());
    }
    let (version, mut body) = split_version(bytes)?;
    let decoded = ConsumerProtocolAssignment::decode(&mut body, version)
        .map_err(|e| anyhow!("Failed to decode group assignment: {}", e))?;

    let mut assignment = Assignment::new();
    for entry in decoded.assigned_partitions {
        let mut partitions = entry.partitions;
        partitions.sort_unstable();
        assignment
            .entry(entry.topic.0.to_string())
            .or_default()
            .extend(partitions);
    }
    Ok(assignment)
}

fn split_version(bytes: &Bytes) -> Result<(i16, Bytes)> {
    if bytes.len() < 2 {
        return Err(anyhow!("consumer protocol payload too short ({} bytes)", bytes.len()));
    }
    let mut body = bytes.clone();
    let version = body.get_i16();
    if version < 0 {
        return Err(anyhow!("invalid consumer protocol version {}", version));
    }
    Ok((version.min(PROTOCOL_VERSION_MAX), body))
}

/// Deals each topic's partitions round-robin over the members subscribed to it
///
/// Members are ordered by id so every leader computes the same result. Every
/// member gets an entry, possibly empty.
pub fn assign_round_robin(
    members: &[(String, Vec<String>)],
    partitions: &HashMap<String, Vec<i32>>,
) -> BTreeMap<String, Assignment> {
    let mut result: BTreeMap<String, Assignment> = members
        .iter()
        .map(|(member, _)| (member.clone(), Assignment::new()))
        .collect();

    let mut topics: Vec<&String> = partitions.keys().collect();
    topics.sort();
    for topic in topics {
        let mut subscribers: Vec<&String> = members
            .iter()
            .filter(|(_, subscribed)| subscribed.contains(topic))
            .map(|(member, _)| member)
            .collect();
        if subscribers.is_empty() {
            continue;
        }
        subscribers.sort();

        let mut topic_partitions = partitions[topic].clone();
        topic_partitions.sort_unstable();
        for (index, partition) in topic_partitions.into_iter().enumerate() {
            let owner = subscribers[index % subscribers.len()];
            if let Some(assignment) = result.get_mut(owner) {
                assignment.entry(topic.clone()).or_default().push(partition);
            }
        }
    }
    result
}

/// This client's membership in one consumer group
pub struct GroupMember {
    group: String,
    topics: Vec<String>,
    member_id: String,
    generation: i32,
    /// Partitions of the current generation; `None` until (re)joined
    assignment: Option<Assignment>,
    last_heartbeat: Instant,
}

impl GroupMember {
    pub fn new(group: &str, topics: &[String]) -> Self {
        Self {
            group: group.to_string(),
            topics: topics.to_vec(),
            member_id: String::new(),
            generation: -1,
            assignment: None,
            last_heartbeat: Instant::now(),
        }
    }

    pub fn generation(&self) -> i32 {
        self.generation
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn assignment(&self) -> Option<&Assignment> {
        self.assignment.as_ref()
    }

    /// Joins when not a member of the current generation, heartbeats when due
    ///
    /// Returns true when a new assignment took effect.
    pub async fn maintain(&mut self, cluster: &KafkaCluster) -> Result<bool> {
        if self.assignment.is_some() {
            if self.last_heartbeat.elapsed() < HEARTBEAT_INTERVAL {
                return Ok(false);
            }
            match self.heartbeat(cluster).await {
                Ok(()) => return Ok(false),
                Err(e) => match broker_error_code(&e) {
                    Some(REBALANCE_IN_PROGRESS) => {
                        debug!("Group '{}' is rebalancing, rejoining", self.group);
                    }
                    Some(ILLEGAL_GENERATION) | Some(UNKNOWN_MEMBER_ID) => {
                        warn!("Member of group '{}' was fenced: {:#}", self.group, e);
                        self.member_id.clear();
                    }
                    _ => return Err(e),
                },
            }
            self.assignment = None;
        }

        self.join(cluster).await?;
        Ok(true)
    }

    async fn heartbeat(&mut self, cluster: &KafkaCluster) -> Result<()> {
        let coordinator = cluster.coordinator(&self.group).await?;
        let result = coordinator
            .heartbeat(&self.group, self.generation, &self.member_id)
            .await;
        match &result {
            Ok(()) => self.last_heartbeat = Instant::now(),
            Err(e) => cluster.invalidate(e, None, Some(&self.group)).await,
        }
        result
    }

    async fn join(&mut self, cluster: &KafkaCluster) -> Result<()> {
        let coordinator = cluster.coordinator(&self.group).await?;
        let joined = match coordinator
            .join_group(
                &self.group,
                &self.member_id,
                SESSION_TIMEOUT,
                REBALANCE_TIMEOUT,
                ASSIGNMENT_STRATEGY,
                encode_subscription(&self.topics)?,
            )
            .await
        {
            Ok(joined) => joined,
            Err(e) => {
                if broker_error_code(&e) == Some(UNKNOWN_MEMBER_ID) {
                    self.member_id.clear();
                }
                cluster.invalidate(&e, None, Some(&self.group)).await;
                return Err(e);
            }
        };
        self.member_id = joined.member_id.clone();
        self.generation = joined.generation;

        let assignments = if joined.leader == joined.member_id {
            let mut subscriptions = Vec::with_capacity(joined.members.len());
            for (member, metadata) in &joined.members {
                subscriptions.push((member.clone(), decode_subscription(metadata)?));
            }
            let mut partitions = HashMap::new();
            for (_, topics) in &subscriptions {
                for topic in topics {
                    if !partitions.contains_key(topic) {
                        partitions.insert(topic.clone(), cluster.partitions(topic).await?);
                    }
                }
            }
            let mut encoded = Vec::with_capacity(subscriptions.len());
            for (member, assignment) in assign_round_robin(&subscriptions, &partitions) {
                encoded.push((member, encode_assignment(&assignment)?));
            }
            encoded
        } else {
            Vec::new()
        };

        let synced = coordinator
            .sync_group(&self.group, self.generation, &self.member_id, assignments)
            .await;
        let assignment = match synced {
            Ok(bytes) => decode_assignment(&bytes)?,
            Err(e) => {
                cluster.invalidate(&e, None, Some(&self.group)).await;
                return Err(e);
            }
        };

        info!(
            "Joined group '{}' as {} (generation {}, protocol {}): {:?}",
            self.group, self.member_id, self.generation, joined.protocol, assignment
        );
        self.assignment = Some(assignment);
        self.last_heartbeat = Instant::now();
        Ok(())
    }

    /// Leaves the group so the remaining members rebalance at once
    pub async fn leave(&mut self, cluster: &KafkaCluster) -> Result<()> {
        self.assignment = None;
        if self.member_id.is_empty() {
            return Ok(());
        }
        let coordinator = cluster.coordinator(&self.group).await?;
        let member_id = std::mem::take(&mut self.member_id);
        coordinator.leave_group(&self.group, &member_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, topics: &[&str]) -> (String, Vec<String>) {
        (id.to_string(), topics.iter().map(|t| t.to_string()).collect())
    }

    #[test]
    fn test_round_robin_splits_partitions() {
        let members = vec![member("m-2", &["t1"]), member("m-1", &["t1", "t2"])];
        let partitions = HashMap::from([
            ("t1".to_string(), vec![2, 0, 1]),
            ("t2".to_string(), vec![0]),
        ]);
        let assigned = assign_round_robin(&members, &partitions);

        assert_eq!(assigned["m-1"]["t1"], vec![0, 2]);
        assert_eq!(assigned["m-2"]["t1"], vec![1]);
        assert_eq!(assigned["m-1"]["t2"], vec![0]);
        assert!(!assigned["m-2"].contains_key("t2"));
    }

    #[test]
    fn test_more_members_than_partitions() {
        let members = vec![member("a", &["t"]), member("b", &["t"])];
        let partitions = HashMap::from([("t".to_string(), vec![0])]);
        let assigned = assign_round_robin(&members, &partitions);

        assert_eq!(assigned["a"]["t"], vec![0]);
        assert!(assigned["b"].is_empty());
        let total: usize = assigned.values().flat_map(|a| a.values()).map(Vec::len).sum();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_protocol_payloads() {
        let topics = vec!["orders".to_string(), "payments".to_string()];
        let metadata = encode_subscription(&topics).unwrap();
        assert_eq!(&metadata[..2], &0i16.to_be_bytes());
        assert_eq!(decode_subscription(&metadata).unwrap(), topics);

        let assignment = Assignment::from([("orders".to_string(), vec![0, 2])]);
        let encoded = encode_assignment(&assignment).unwrap();
        assert_eq!(decode_assignment(&encoded).unwrap(), assignment);

        assert!(decode_assignment(&Bytes::new()).unwrap().is_empty());
        assert!(decode_subscription(&Bytes::from_static(&[0])).is_err());
    }

    #[test]
    fn test_new_member_has_not_joined() {
        let member = GroupMember::new("G1", &["t1".to_string()]);
        assert_eq!(member.generation(), -1);
        assert_eq!(member.member_id(), "");
        assert!(member.assignment().is_none());
    }
}
