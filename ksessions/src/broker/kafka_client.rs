//! Kafka Client Implementation
//!
//! This module provides a low-level Kafka client that communicates directly with a broker
//! using the Kafka protocol. It handles connection management, API version negotiation,
//! request framing, and the APIs the sessions need: metadata, produce, fetch, list-offsets,
//! coordinator lookup, group membership and group offset fetch/commit. A client talks to
//! one broker; routing to partition leaders and group coordinators is done by
//! [`super::kafka_cluster::KafkaCluster`].

use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use kafka_protocol::{
    messages::{
        api_versions_request::ApiVersionsRequest,
        api_versions_response::ApiVersionsResponse,
        fetch_request::{FetchPartition, FetchRequest, FetchTopic},
        fetch_response::FetchResponse,
        find_coordinator_request::FindCoordinatorRequest,
        find_coordinator_response::FindCoordinatorResponse,
        heartbeat_request::HeartbeatRequest,
        heartbeat_response::HeartbeatResponse,
        join_group_request::{JoinGroupRequest, JoinGroupRequestProtocol},
        join_group_response::JoinGroupResponse,
        leave_group_request::LeaveGroupRequest,
        leave_group_response::LeaveGroupResponse,
        list_offsets_request::{ListOffsetsPartition, ListOffsetsRequest, ListOffsetsTopic},
        list_offsets_response::ListOffsetsResponse,
        metadata_request::{MetadataRequest, MetadataRequestTopic},
        metadata_response::MetadataResponse,
        offset_commit_request::{
            OffsetCommitRequest, OffsetCommitRequestPartition, OffsetCommitRequestTopic,
        },
        offset_commit_response::OffsetCommitResponse,
        offset_fetch_request::{OffsetFetchRequest, OffsetFetchRequestTopic},
        offset_fetch_response::OffsetFetchResponse,
        produce_request::{PartitionProduceData, ProduceRequest, TopicProduceData},
        produce_response::ProduceResponse,
        sync_group_request::{SyncGroupRequest, SyncGroupRequestAssignment},
        sync_group_response::SyncGroupResponse,
        ApiKey, BrokerId, GroupId, RequestHeader, ResponseHeader, TopicName,
    },
    protocol::{Decodable, Encodable, StrBytes},
    records::{
        Compression, Record, RecordBatchDecoder, RecordBatchEncoder, RecordEncodeOptions,
        TimestampType,
    },
};
use std::{
    collections::{BTreeMap, HashMap},
    io::Cursor,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
    time::{sleep, timeout, Duration},
};
use tracing::{debug, info, warn};

use crate::utils::verify_record_batch_crc;

/// Largest response body accepted from a broker
const MAX_RESPONSE_SIZE: usize = 100 * 1024 * 1024;

/// Maximum bytes requested per partition in one fetch
const PARTITION_MAX_BYTES: i32 = 1024 * 1024;

const MEMBER_ID_REQUIRED: i16 = 79;

/// Low-level Kafka client for direct broker communication
///
/// This client keeps one TCP connection to a bootstrap broker and handles:
/// - Protocol message encoding/decoding
/// - API version negotiation and compatibility
/// - Request correlation and response matching
/// - Dropping a connection whose exchange failed and reconnecting on next use
pub struct KafkaClient {
    /// Current connection, `None` after a failed exchange until the next request reconnects
    stream: Arc<Mutex<Option<TcpStream>>>,

    /// Bootstrap addresses tried in order when (re)connecting
    bootstrap: Vec<String>,

    /// Client identifier sent in every request header
    client_id: String,

    /// Bound on connecting and on each request/response exchange
    io_timeout: Duration,

    /// Monotonically increasing correlation ID for request/response matching
    correlation_id: AtomicU64,

    /// Set by `close()`; a closed client never reconnects
    closed: AtomicBool,

    /// Supported API versions discovered from the broker
    /// Maps API key (i16) to (min_version, max_version) tuple
    pub api_versions: HashMap<i16, (i16, i16)>,
}

/// A broker-reported error code on a named operation
///
/// Callers route on the code, e.g. dropping a cached leader on `NOT_LEADER_OR_FOLLOWER`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed: {}", error_name(.code.clone()))]
pub struct BrokerError {
    pub operation: String,
    pub code: i16,
}

impl BrokerError {
    fn new(operation: impl Into<String>, code: i16) -> Self {
        Self {
            operation: operation.into(),
            code,
        }
    }
}

/// Kafka error code carried by `err`, if it came from a broker response
pub fn broker_error_code(err: &anyhow::Error) -> Option<i16> {
    err.downcast_ref::<BrokerError>().map(|e| e.code)
}

/// Partition leaders of one topic plus the addresses of the brokers that lead them
#[derive(Debug, Clone, Default)]
pub struct TopicRoute {
    /// Broker id to "host:port"
    pub brokers: HashMap<i32, String>,
    /// Partition id to leader broker id; -1 while a partition has no leader
    pub leaders: BTreeMap<i32, i32>,
}

/// Outcome of a completed JoinGroup
#[derive(Debug, Clone)]
pub struct JoinedGroup {
    pub generation: i32,
    pub member_id: String,
    pub leader: String,
    pub protocol: String,
    /// Member ids and protocol metadata; only filled in for the leader
    pub members: Vec<(String, Bytes)>,
}

/// Offsets assigned to a produced record
#[derive(Debug, Clone, Copy)]
pub struct ProduceAck {
    pub partition: i32,
    pub base_offset: i64,
}

/// Records returned for one partition by a fetch
#[derive(Debug, Default)]
pub struct PartitionFetch {
    pub topic: String,
    pub partition: i32,
    pub error_code: i16,
    pub high_watermark: i64,
    pub records: Vec<Record>,
}

impl KafkaClient {
    /// Establishes a connection to a Kafka broker and discovers supported API versions
    ///
    /// # Arguments
    /// * `bootstrap` - Broker addresses in "host:port" format, tried in order
    /// * `client_id` - Identifier reported to the broker in request headers
    /// * `io_timeout` - Bound on connecting and on every request
    ///
    /// # Returns
    /// * `Ok(KafkaClient)` - Fully initialized client ready for operations
    /// * `Err(anyhow::Error)` - If no bootstrap broker answers or version discovery fails
    pub async fn connect(bootstrap: &[String], client_id: &str, io_timeout: Duration) -> Result<Self> {
        if bootstrap.is_empty() {
            bail!("No bootstrap brokers configured");
        }
        info!("Connecting to Kafka bootstrap brokers {:?}", bootstrap);

        let stream = Self::connect_with_retry(bootstrap, io_timeout, 2).await?;

        let mut client = KafkaClient {
            stream: Arc::new(Mutex::new(Some(stream))),
            bootstrap: bootstrap.to_vec(),
            client_id: client_id.to_string(),
            io_timeout,
            correlation_id: AtomicU64::new(1),
            api_versions: HashMap::new(),
            closed: AtomicBool::new(false),
        };

        client.discover_api_versions().await?;

        Ok(client)
    }

    /// Attempts to reach any bootstrap broker, cycling through the list `max_attempts` times
    async fn connect_with_retry(
        bootstrap: &[String],
        io_timeout: Duration,
        max_attempts: usize,
    ) -> Result<TcpStream> {
        let retry_interval = Duration::from_millis(500);
        let mut last_error = anyhow!("no connection attempt made");

        for attempt in 1..=max_attempts {
            for broker in bootstrap {
                match timeout(io_timeout, TcpStream::connect(broker.as_str())).await {
                    Ok(Ok(stream)) => {
                        if attempt > 1 {
                            info!("Connected to Kafka broker {} on attempt {}", broker, attempt);
                        } else {
                            debug!("Connected to Kafka broker {}", broker);
                        }
                        return Ok(stream);
                    }
                    Ok(Err(e)) => {
                        last_error = anyhow!("Failed to connect to Kafka broker at {}: {}", broker, e);
                    }
                    Err(_) => {
                        last_error = anyhow!(
                            "Timed out after {:?} connecting to Kafka broker at {}",
                            io_timeout,
                            broker
                        );
                    }
                }
            }

            if attempt < max_attempts {
                warn!("Connection attempt {} failed, retrying: {:#}", attempt, last_error);
                sleep(retry_interval).await;
            }
        }

        Err(last_error.context(format!(
            "no bootstrap broker reachable after {} attempts",
            max_attempts
        )))
    }

    /// Encodes a request into a length-prefixed frame
    fn encode_frame<T: Encodable>(
        &self,
        api_key: ApiKey,
        request: &T,
        version: i16,
        correlation_id: i32,
    ) -> Result<Vec<u8>> {
        let mut header = RequestHeader::default();
        header.request_api_key = api_key as i16;
        header.request_api_version = version;
        header.correlation_id = correlation_id;
        header.client_id = Some(StrBytes::from_string(self.client_id.clone()));

        let header_version = api_key.request_header_version(version);

        let mut buf = Vec::new();
        header
            .encode(&mut buf, header_version)
            .map_err(|e| anyhow!("Failed to encode request header: {}", e))?;
        request
            .encode(&mut buf, version)
            .map_err(|e| anyhow!("Failed to encode request body: {}", e))?;

        // Kafka protocol uses 4-byte big-endian length prefix
        let mut frame = Vec::with_capacity(4 + buf.len());
        frame.extend_from_slice(&(buf.len() as i32).to_be_bytes());
        frame.extend_from_slice(&buf);
        Ok(frame)
    }

    /// Writes one frame and reads one framed response
    async fn exchange(stream: &mut TcpStream, frame: &[u8]) -> Result<Bytes> {
        stream
            .write_all(frame)
            .await
            .map_err(|e| anyhow!("Failed to write request to stream: {}", e))?;

        let mut size_buf = [0u8; 4];
        stream.read_exact(&mut size_buf).await.map_err(|e| {
            anyhow!(
                "Failed to read response size: {} (the broker may have closed the connection)",
                e
            )
        })?;

        let response_size = i32::from_be_bytes(size_buf) as usize;
        if response_size > MAX_RESPONSE_SIZE {
            bail!("Response size too large: {} bytes", response_size);
        }

        let mut response_buf = vec![0u8; response_size];
        stream
            .read_exact(&mut response_buf)
            .await
            .map_err(|e| anyhow!("Failed to read response body: {}", e))?;

        Ok(Bytes::from(response_buf))
    }

    /// Sends a Kafka protocol request and returns the raw response bytes
    ///
    /// The whole exchange is bounded by the client's I/O timeout. When the exchange fails
    /// or times out the connection is dropped, since its framing can no longer be trusted;
    /// the next request reconnects.
    pub async fn send_request<T: Encodable + std::fmt::Debug>(
        &self,
        api_key: ApiKey,
        request: &T,
        version: i16,
    ) -> Result<Bytes> {
        self.send_request_within(api_key, request, version, self.io_timeout)
            .await
    }

    /// Like [`Self::send_request`], bounding this one exchange by `wait` instead
    pub async fn send_request_within<T: Encodable + std::fmt::Debug>(
        &self,
        api_key: ApiKey,
        request: &T,
        version: i16,
        wait: Duration,
    ) -> Result<Bytes> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("Client {} is closed", self.client_id);
        }

        let correlation_id = self.correlation_id.fetch_add(1, Ordering::SeqCst) as i32;
        debug!(
            "Sending {:?} request (correlation_id: {}, version: {})",
            api_key, correlation_id, version
        );
        let frame = self.encode_frame(api_key, request, version, correlation_id)?;

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            debug!("Reconnecting client {}", self.client_id);
            *guard = Some(Self::connect_with_retry(&self.bootstrap, self.io_timeout, 1).await?);
        }
        let stream = guard
            .as_mut()
            .ok_or_else(|| anyhow!("Connection unavailable"))?;

        let outcome = timeout(wait, Self::exchange(stream, &frame)).await;
        match outcome {
            Ok(Ok(response)) => {
                if response.len() < 4 {
                    *guard = None;
                    bail!("Truncated {:?} response ({} bytes)", api_key, response.len());
                }
                let echoed = i32::from_be_bytes([response[0], response[1], response[2], response[3]]);
                if echoed != correlation_id {
                    *guard = None;
                    bail!(
                        "Correlation id mismatch on {:?}: sent {}, received {}",
                        api_key,
                        correlation_id,
                        echoed
                    );
                }
                Ok(response)
            }
            Ok(Err(e)) => {
                *guard = None;
                Err(e)
            }
            Err(_) => {
                *guard = None;
                Err(anyhow!("{:?} request timed out after {:?}", api_key, wait))
            }
        }
    }

    /// Sends a request at a negotiated version and decodes the typed response
    async fn call<Req, Resp>(&self, api_key: ApiKey, request: &Req, preferred_version: i16) -> Result<Resp>
    where
        Req: Encodable + std::fmt::Debug,
        Resp: Decodable,
    {
        self.call_within(api_key, request, preferred_version, self.io_timeout)
            .await
    }

    async fn call_within<Req, Resp>(
        &self,
        api_key: ApiKey,
        request: &Req,
        preferred_version: i16,
        wait: Duration,
    ) -> Result<Resp>
    where
        Req: Encodable + std::fmt::Debug,
        Resp: Decodable,
    {
        let version = self.get_supported_version(api_key, preferred_version);
        let response = self
            .send_request_within(api_key, request, version, wait)
            .await?;
        decode_response(api_key, version, &response)
    }

    /// Discovers and caches the broker's supported API versions
    async fn discover_api_versions(&mut self) -> Result<()> {
        debug!("Discovering supported API versions...");

        // Version 0 is universally supported
        let request = ApiVersionsRequest::default();
        let response: ApiVersionsResponse = {
            let bytes = self.send_request(ApiKey::ApiVersions, &request, 0).await?;
            decode_response(ApiKey::ApiVersions, 0, &bytes)?
        };

        if response.error_code != 0 {
            bail!("ApiVersions failed: {}", error_name(response.error_code));
        }

        for api_version in response.api_keys {
            self.api_versions.insert(
                api_version.api_key,
                (api_version.min_version, api_version.max_version),
            );
        }

        debug!("Discovered {} supported APIs", self.api_versions.len());
        Ok(())
    }

    /// Selects a compatible protocol version for the given API
    ///
    /// Uses the preferred version when the broker supports it, otherwise the broker's
    /// highest version; falls back to the preferred version if the API was not discovered.
    pub fn get_supported_version(&self, api_key: ApiKey, preferred_version: i16) -> i16 {
        if let Some((min_version, max_version)) = self.api_versions.get(&(api_key as i16)) {
            if preferred_version >= *min_version && preferred_version <= *max_version {
                preferred_version
            } else {
                debug!(
                    "Preferred version {} for {:?} not supported (range: {}-{}), using {}",
                    preferred_version, api_key, min_version, max_version, max_version
                );
                *max_version
            }
        } else {
            warn!(
                "API {:?} not found in version discovery, using version {}",
                api_key, preferred_version
            );
            preferred_version
        }
    }

    /// Returns the partition leaders of `topic`; no partitions when the broker does not know it
    pub async fn topic_route(&self, topic: &str) -> Result<TopicRoute> {
        let mut request = MetadataRequest::default();
        let mut requested = MetadataRequestTopic::default();
        requested.name = Some(topic_name(topic));
        request.topics = Some(vec![requested]);

        let response: MetadataResponse = self
            .call(ApiKey::Metadata, &request, 1)
            .await
            .with_context(|| format!("metadata request for '{}' failed", topic))?;

        let mut route = TopicRoute::default();
        for broker in &response.brokers {
            route
                .brokers
                .insert(broker.node_id.0, format!("{}:{}", broker.host.as_str(), broker.port));
        }

        for topic_metadata in response.topics {
            let matches = topic_metadata
                .name
                .as_ref()
                .map_or(false, |name| name.0.as_str() == topic);
            if !matches {
                continue;
            }
            match topic_metadata.error_code {
                0 => {
                    for partition in &topic_metadata.partitions {
                        route
                            .leaders
                            .insert(partition.partition_index, partition.leader_id.0);
                    }
                }
                // Unknown topics are not an error for callers; they simply have no partitions
                3 | 5 => {}
                code => return Err(BrokerError::new(format!("metadata for '{}'", topic), code).into()),
            }
        }

        Ok(route)
    }

    /// Finds the broker coordinating `group`; returns its id and "host:port"
    pub async fn find_coordinator(&self, group: &str) -> Result<(i32, String)> {
        let mut request = FindCoordinatorRequest::default();
        request.key = StrBytes::from_string(group.to_string());
        request.key_type = 0;

        let response: FindCoordinatorResponse = self.call(ApiKey::FindCoordinator, &request, 2).await?;
        if let Some(coordinator) = response.coordinators.first() {
            // v4 and later answer in the batched form
            if coordinator.error_code != 0 {
                return Err(BrokerError::new(
                    format!("coordinator lookup for group '{}'", group),
                    coordinator.error_code,
                )
                .into());
            }
            return Ok((
                coordinator.node_id.0,
                format!("{}:{}", coordinator.host.as_str(), coordinator.port),
            ));
        }
        if response.error_code != 0 {
            return Err(BrokerError::new(
                format!("coordinator lookup for group '{}'", group),
                response.error_code,
            )
            .into());
        }
        Ok((
            response.node_id.0,
            format!("{}:{}", response.host.as_str(), response.port),
        ))
    }

    /// Joins (or rejoins) `group` with the "consumer" protocol, waiting for the rebalance
    ///
    /// The exchange may legitimately block for the whole `rebalance_timeout`.
    pub async fn join_group(
        &self,
        group: &str,
        member_id: &str,
        session_timeout: Duration,
        rebalance_timeout: Duration,
        protocol: &str,
        metadata: Bytes,
    ) -> Result<JoinedGroup> {
        let mut member_id = member_id.to_string();
        // A broker may ask for a second attempt carrying the member id it just assigned
        for _ in 0..2 {
            let mut offered = JoinGroupRequestProtocol::default();
            offered.name = StrBytes::from_string(protocol.to_string());
            offered.metadata = metadata.clone();

            let mut request = JoinGroupRequest::default();
            request.group_id = GroupId(StrBytes::from_string(group.to_string()));
            request.session_timeout_ms = session_timeout.as_millis() as i32;
            request.rebalance_timeout_ms = rebalance_timeout.as_millis() as i32;
            request.member_id = StrBytes::from_string(member_id.clone());
            request.protocol_type = StrBytes::from_static_str("consumer");
            request.protocols = vec![offered];

            let response: JoinGroupResponse = self
                .call_within(ApiKey::JoinGroup, &request, 2, rebalance_timeout + self.io_timeout)
                .await?;
            match response.error_code {
                0 => {
                    return Ok(JoinedGroup {
                        generation: response.generation_id,
                        member_id: response.member_id.to_string(),
                        leader: response.leader.to_string(),
                        protocol: response
                            .protocol_name
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| protocol.to_string()),
                        members: response
                            .members
                            .into_iter()
                            .map(|m| (m.member_id.to_string(), m.metadata))
                            .collect(),
                    });
                }
                MEMBER_ID_REQUIRED if !response.member_id.is_empty() => {
                    member_id = response.member_id.to_string();
                }
                code => {
                    return Err(BrokerError::new(format!("join of group '{}'", group), code).into());
                }
            }
        }
        Err(BrokerError::new(format!("join of group '{}'", group), MEMBER_ID_REQUIRED).into())
    }

    /// Completes a rebalance; the leader passes every member's assignment, others pass none
    pub async fn sync_group(
        &self,
        group: &str,
        generation: i32,
        member_id: &str,
        assignments: Vec<(String, Bytes)>,
    ) -> Result<Bytes> {
        let mut request = SyncGroupRequest::default();
        request.group_id = GroupId(StrBytes::from_string(group.to_string()));
        request.generation_id = generation;
        request.member_id = StrBytes::from_string(member_id.to_string());
        request.assignments = assignments
            .into_iter()
            .map(|(member, assignment)| {
                let mut entry = SyncGroupRequestAssignment::default();
                entry.member_id = StrBytes::from_string(member);
                entry.assignment = assignment;
                entry
            })
            .collect();

        let response: SyncGroupResponse = self.call(ApiKey::SyncGroup, &request, 1).await?;
        if response.error_code != 0 {
            return Err(BrokerError::new(format!("sync of group '{}'", group), response.error_code).into());
        }
        Ok(response.assignment)
    }

    pub async fn heartbeat(&self, group: &str, generation: i32, member_id: &str) -> Result<()> {
        let mut request = HeartbeatRequest::default();
        request.group_id = GroupId(StrBytes::from_string(group.to_string()));
        request.generation_id = generation;
        request.member_id = StrBytes::from_string(member_id.to_string());

        let response: HeartbeatResponse = self.call(ApiKey::Heartbeat, &request, 1).await?;
        if response.error_code != 0 {
            return Err(BrokerError::new(format!("heartbeat to group '{}'", group), response.error_code).into());
        }
        Ok(())
    }

    pub async fn leave_group(&self, group: &str, member_id: &str) -> Result<()> {
        let mut request = LeaveGroupRequest::default();
        request.group_id = GroupId(StrBytes::from_string(group.to_string()));
        request.member_id = StrBytes::from_string(member_id.to_string());

        let response: LeaveGroupResponse = self.call(ApiKey::LeaveGroup, &request, 1).await?;
        if response.error_code != 0 {
            return Err(BrokerError::new(format!("leave of group '{}'", group), response.error_code).into());
        }
        Ok(())
    }

    /// Produces a single record to `partition` and returns the broker-assigned offset
    pub async fn produce(
        &self,
        topic: &str,
        partition: i32,
        value: Bytes,
        acks: i16,
        request_timeout: Duration,
    ) -> Result<ProduceAck> {
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as i64;

        // Offset is always 0 in produce requests; the broker assigns the actual offset
        let record = Record {
            transactional: false,
            control: false,
            partition_leader_epoch: 0,
            producer_id: -1,
            producer_epoch: -1,
            timestamp_type: TimestampType::Creation,
            offset: 0,
            sequence: -1,
            timestamp,
            key: None,
            value: Some(value),
            headers: indexmap::IndexMap::new(),
        };

        let options = RecordEncodeOptions {
            version: 2,
            compression: Compression::None,
        };
        let mut batch_buf = bytes::BytesMut::new();
        RecordBatchEncoder::encode(&mut batch_buf, vec![&record], &options)
            .map_err(|e| anyhow!("Failed to encode record batch: {}", e))?;

        let mut partition_data = PartitionProduceData::default();
        partition_data.index = partition;
        partition_data.records = Some(batch_buf.freeze());

        let mut topic_data = TopicProduceData::default();
        topic_data.name = topic_name(topic);
        topic_data.partition_data.push(partition_data);

        let mut request = ProduceRequest::default();
        request.acks = acks;
        request.timeout_ms = request_timeout.as_millis() as i32;
        request.topic_data.push(topic_data);

        let response: ProduceResponse = self.call(ApiKey::Produce, &request, 3).await?;

        for topic_response in &response.responses {
            for partition_response in &topic_response.partition_responses {
                if partition_response.index != partition {
                    continue;
                }
                if partition_response.error_code != 0 {
                    return Err(BrokerError::new(
                        format!("produce to {}[{}]", topic, partition),
                        partition_response.error_code,
                    )
                    .into());
                }
                return Ok(ProduceAck {
                    partition,
                    base_offset: partition_response.base_offset,
                });
            }
        }

        Err(anyhow!(
            "produce response did not mention {}[{}]",
            topic,
            partition
        ))
    }

    /// Fetches from each `(topic, partition, offset)` position, waiting up to `max_wait`
    pub async fn fetch(
        &self,
        positions: &[(String, i32, i64)],
        max_wait: Duration,
    ) -> Result<Vec<PartitionFetch>> {
        let mut topics: Vec<FetchTopic> = Vec::new();
        for (topic, partition, offset) in positions {
            let mut fetch_partition = FetchPartition::default();
            fetch_partition.partition = *partition;
            fetch_partition.current_leader_epoch = -1;
            fetch_partition.fetch_offset = *offset;
            fetch_partition.log_start_offset = -1;
            fetch_partition.partition_max_bytes = PARTITION_MAX_BYTES;

            match topics.iter_mut().find(|t| t.topic.0.as_str() == topic.as_str()) {
                Some(existing) => existing.partitions.push(fetch_partition),
                None => {
                    let mut fetch_topic = FetchTopic::default();
                    fetch_topic.topic = topic_name(topic);
                    fetch_topic.partitions.push(fetch_partition);
                    topics.push(fetch_topic);
                }
            }
        }

        let mut request = FetchRequest::default();
        request.max_wait_ms = max_wait.as_millis() as i32;
        request.min_bytes = 1;
        request.max_bytes = 16 * 1024 * 1024;
        request.isolation_level = 0;
        request.session_id = 0;
        request.session_epoch = -1;
        request.topics = topics;
        request.rack_id = StrBytes::from_static_str("");

        let response: FetchResponse = self.call(ApiKey::Fetch, &request, 4).await?;

        let mut results = Vec::new();
        for topic_response in response.responses {
            let topic = topic_response.topic.0.to_string();
            for partition_response in topic_response.partitions {
                let records = match (&partition_response.records, partition_response.error_code) {
                    (Some(bytes), 0) if !bytes.is_empty() => decode_record_batches(bytes)?,
                    _ => Vec::new(),
                };
                results.push(PartitionFetch {
                    topic: topic.clone(),
                    partition: partition_response.partition_index,
                    error_code: partition_response.error_code,
                    high_watermark: partition_response.high_watermark,
                    records,
                });
            }
        }
        Ok(results)
    }

    /// Looks up the offset at `timestamp` (-1 latest, -2 earliest) for one partition
    pub async fn list_offset(&self, topic: &str, partition: i32, timestamp: i64) -> Result<i64> {
        let mut list_partition = ListOffsetsPartition::default();
        list_partition.partition_index = partition;
        list_partition.current_leader_epoch = -1;
        list_partition.timestamp = timestamp;

        let mut list_topic = ListOffsetsTopic::default();
        list_topic.name = topic_name(topic);
        list_topic.partitions.push(list_partition);

        let mut request = ListOffsetsRequest::default();
        request.replica_id = BrokerId(-1);
        request.isolation_level = 0;
        request.topics.push(list_topic);

        let response: ListOffsetsResponse = self.call(ApiKey::ListOffsets, &request, 1).await?;

        for topic_response in &response.topics {
            for partition_response in &topic_response.partitions {
                if partition_response.partition_index != partition {
                    continue;
                }
                if partition_response.error_code != 0 {
                    return Err(BrokerError::new(
                        format!("list offsets for {}[{}]", topic, partition),
                        partition_response.error_code,
                    )
                    .into());
                }
                return Ok(partition_response.offset);
            }
        }

        Err(anyhow!("list offsets response did not mention {}[{}]", topic, partition))
    }

    /// Returns the committed offset of `group` for each partition, -1 where nothing is committed
    pub async fn committed_offsets(
        &self,
        group: &str,
        topic: &str,
        partitions: &[i32],
    ) -> Result<HashMap<i32, i64>> {
        let mut fetch_topic = OffsetFetchRequestTopic::default();
        fetch_topic.name = topic_name(topic);
        fetch_topic.partition_indexes = partitions.to_vec();

        let mut request = OffsetFetchRequest::default();
        request.group_id = GroupId(StrBytes::from_string(group.to_string()));
        request.topics = Some(vec![fetch_topic]);

        let response: OffsetFetchResponse = self.call(ApiKey::OffsetFetch, &request, 1).await?;
        if response.error_code != 0 {
            return Err(BrokerError::new(format!("offset fetch for group '{}'", group), response.error_code).into());
        }

        let mut committed = HashMap::new();
        for topic_response in response.topics {
            if topic_response.name.0.as_str() != topic {
                continue;
            }
            for partition in topic_response.partitions {
                if partition.error_code != 0 {
                    return Err(BrokerError::new(
                        format!("offset fetch for {}[{}]", topic, partition.partition_index),
                        partition.error_code,
                    )
                    .into());
                }
                committed.insert(partition.partition_index, partition.committed_offset);
            }
        }
        Ok(committed)
    }

    /// Commits `offset` as the next position of `group` on one partition
    ///
    /// `generation` and `member_id` identify the committing member; a member outside the
    /// current generation is rejected by the coordinator.
    pub async fn commit_offset(
        &self,
        group: &str,
        generation: i32,
        member_id: &str,
        topic: &str,
        partition: i32,
        offset: i64,
    ) -> Result<()> {
        let mut commit_partition = OffsetCommitRequestPartition::default();
        commit_partition.partition_index = partition;
        commit_partition.committed_offset = offset;

        let mut commit_topic = OffsetCommitRequestTopic::default();
        commit_topic.name = topic_name(topic);
        commit_topic.partitions.push(commit_partition);

        let mut request = OffsetCommitRequest::default();
        request.group_id = GroupId(StrBytes::from_string(group.to_string()));
        request.generation_id_or_member_epoch = generation;
        request.member_id = StrBytes::from_string(member_id.to_string());
        request.topics.push(commit_topic);

        let response: OffsetCommitResponse = self.call(ApiKey::OffsetCommit, &request, 2).await?;
        for topic_response in &response.topics {
            for partition_response in &topic_response.partitions {
                if partition_response.error_code != 0 {
                    return Err(BrokerError::new(
                        format!(
                            "commit of {}[{}]@{} for group '{}'",
                            topic, partition_response.partition_index, offset, group
                        ),
                        partition_response.error_code,
                    )
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Waits until no exchange holds the connection, bounded by `wait`
    pub async fn drain(&self, wait: Duration) -> Result<()> {
        timeout(wait, self.stream.lock())
            .await
            .map(|_| ())
            .map_err(|_| anyhow!("outstanding request still running after {:?}", wait))
    }

    /// Shuts the connection down; later requests fail instead of reconnecting
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        let mut guard = self.stream.lock().await;
        if let Some(mut stream) = guard.take() {
            stream
                .shutdown()
                .await
                .map_err(|e| anyhow!("Failed to shut down connection: {}", e))?;
        }
        Ok(())
    }
}

fn topic_name(topic: &str) -> TopicName {
    TopicName(StrBytes::from_string(topic.to_string()))
}

/// Decodes a response header and typed body
pub fn decode_response<R: Decodable>(api_key: ApiKey, version: i16, response: &Bytes) -> Result<R> {
    let mut cursor = Cursor::new(response.as_ref());

    let header_version = api_key.response_header_version(version);
    let _response_header = ResponseHeader::decode(&mut cursor, header_version)
        .map_err(|e| anyhow!("Failed to decode {:?} response header: {}", api_key, e))?;

    R::decode(&mut cursor, version)
        .map_err(|e| anyhow!("Failed to decode {:?} response: {}", api_key, e))
}

/// Decodes every complete record batch in a fetched records blob
///
/// A trailing partial batch (the broker truncates at the byte limit) is ignored;
/// a checksum mismatch is an error.
pub fn decode_record_batches(records: &Bytes) -> Result<Vec<Record>> {
    let mut cursor = Cursor::new(records.as_ref());
    let mut decoded = Vec::new();

    while (cursor.position() as usize) < records.len() {
        let remaining = &records.as_ref()[cursor.position() as usize..];
        if remaining.len() < 12 {
            break;
        }
        let batch_length = i32::from_be_bytes([remaining[8], remaining[9], remaining[10], remaining[11]]);
        if batch_length < 0 || remaining.len() < 12 + batch_length as usize {
            debug!("Skipping partial trailing record batch");
            break;
        }

        verify_record_batch_crc(remaining)?;

        let record_set = RecordBatchDecoder::decode(&mut cursor)
            .map_err(|e| anyhow!("Failed to decode record batch: {}", e))?;
        decoded.extend(record_set.records);
    }

    Ok(decoded)
}

/// Human readable name of a Kafka error code
pub fn error_name(code: i16) -> String {
    match code {
        0 => "NONE".to_string(),
        1 => "OFFSET_OUT_OF_RANGE".to_string(),
        2 => "CORRUPT_MESSAGE".to_string(),
        3 => "UNKNOWN_TOPIC_OR_PARTITION".to_string(),
        5 => "LEADER_NOT_AVAILABLE".to_string(),
        6 => "NOT_LEADER_OR_FOLLOWER".to_string(),
        7 => "REQUEST_TIMED_OUT".to_string(),
        10 => "MESSAGE_TOO_LARGE".to_string(),
        14 => "COORDINATOR_LOAD_IN_PROGRESS".to_string(),
        15 => "COORDINATOR_NOT_AVAILABLE".to_string(),
        16 => "NOT_COORDINATOR".to_string(),
        19 => "NOT_ENOUGH_REPLICAS".to_string(),
        20 => "NOT_ENOUGH_REPLICAS_AFTER_APPEND".to_string(),
        22 => "ILLEGAL_GENERATION".to_string(),
        24 => "INVALID_GROUP_ID".to_string(),
        25 => "UNKNOWN_MEMBER_ID".to_string(),
        26 => "INVALID_SESSION_TIMEOUT".to_string(),
        27 => "REBALANCE_IN_PROGRESS".to_string(),
        29 => "TOPIC_AUTHORIZATION_FAILED".to_string(),
        30 => "GROUP_AUTHORIZATION_FAILED".to_string(),
        79 => "MEMBER_ID_REQUIRED".to_string(),
        _ => format!("Unknown Kafka error code: {}", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_batch(base_offset: i64, values: &[&str]) -> bytes::BytesMut {
        let records: Vec<Record> = values
            .iter()
            .enumerate()
            .map(|(i, v)| Record {
                transactional: false,
                control: false,
                partition_leader_epoch: 0,
                producer_id: -1,
                producer_epoch: -1,
                timestamp_type: TimestampType::Creation,
                offset: base_offset + i as i64,
                sequence: -1,
                timestamp: 0,
                key: None,
                value: Some(Bytes::from(v.to_string())),
                headers: indexmap::IndexMap::new(),
            })
            .collect();
        let options = RecordEncodeOptions {
            version: 2,
            compression: Compression::None,
        };
        let mut buf = bytes::BytesMut::new();
        RecordBatchEncoder::encode(&mut buf, records.iter().collect::<Vec<_>>(), &options).unwrap();
        buf
    }

    #[test]
    fn test_error_code_mapping() {
        let test_cases = vec![
            (1, "OFFSET_OUT_OF_RANGE"),
            (3, "UNKNOWN_TOPIC_OR_PARTITION"),
            (16, "NOT_COORDINATOR"),
            (29, "TOPIC_AUTHORIZATION_FAILED"),
            (999, "Unknown Kafka error code: 999"),
        ];
        for (code, expected) in test_cases {
            assert_eq!(error_name(code), expected);
        }
    }

    #[test]
    fn test_decode_record_batches_reads_consecutive_batches() {
        let mut blob = sample_batch(10, &["a", "b"]);
        blob.extend_from_slice(&sample_batch(12, &["c"]));
        let records = decode_record_batches(&blob.freeze()).unwrap();

        let offsets: Vec<i64> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![10, 11, 12]);
        assert_eq!(records[2].value.as_deref(), Some(&b"c"[..]));
    }

    #[test]
    fn test_decode_record_batches_ignores_partial_tail() {
        let mut blob = sample_batch(0, &["only"]);
        let next = sample_batch(1, &["truncated"]);
        blob.extend_from_slice(&next[..next.len() / 2]);
        let records = decode_record_batches(&blob.freeze()).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_decode_record_batches_rejects_corruption() {
        let mut blob = sample_batch(0, &["payload"]);
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(decode_record_batches(&blob.freeze()).is_err());
    }

    #[test]
    fn test_metadata_request_encoding() {
        let mut request = MetadataRequest::default();
        let mut requested = MetadataRequestTopic::default();
        requested.name = Some(topic_name("orders"));
        request.topics = Some(vec![requested]);

        let mut buf = Vec::new();
        request.encode(&mut buf, 1).unwrap();
        // int32 array length followed by int16 string length and the name
        assert_eq!(&buf[..4], &1i32.to_be_bytes());
        assert_eq!(&buf[4..6], &6i16.to_be_bytes());
        assert_eq!(&buf[6..12], b"orders");
    }
}
