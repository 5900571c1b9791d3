//! gRPC schema and glue for the worker node service.
//!
//! RPC schema source: `proto/rowmill.proto`.
//!
//! Key RPCs (generated under [`v1`]):
//! - `CreateTasks`
//! - `PushData` (client stream), `PollData` (server stream)
//!
//! Data streams identify their target through request metadata, parsed and
//! rendered by [`DataHeader`]; [`to_status`] / [`from_status`] translate the
//! shared error taxonomy across the RPC boundary.

use tonic::metadata::MetadataMap;
use tonic::{Code, Status};

use rowmill_common::{MillError, Row};

#[allow(missing_docs)]
pub mod v1 {
    tonic::include_proto!("rowmill.v1");
}

pub use v1::node_client::NodeClient;
pub use v1::node_server::{Node, NodeServer};

/// Metadata key carrying the canonical task reference.
pub const TASK_ID_KEY: &str = "task-id";
/// Metadata key carrying the producer's advertised host.
pub const FROM_HOST_KEY: &str = "from-host";

/// Stream header describing the task a data stream targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHeader {
    /// Owning job id.
    pub job_id: String,
    /// Target stage name.
    pub stage_name: String,
    /// Target partition id.
    pub partition_id: String,
    /// Advertised host of the producing node.
    pub from_host: String,
}

impl DataHeader {
    /// The `jobID/stageName/partitionID` wire string.
    pub fn task_id(&self) -> String {
        format!("{}/{}/{}", self.job_id, self.stage_name, self.partition_id)
    }

    /// Write the header onto outgoing request metadata.
    pub fn apply(&self, metadata: &mut MetadataMap) -> Result<(), MillError> {
        let task_id = self
            .task_id()
            .parse()
            .map_err(|e| MillError::InvalidArgument(format!("unencodable task id: {e}")))?;
        let from_host = self
            .from_host
            .parse()
            .map_err(|e| MillError::InvalidArgument(format!("unencodable from-host: {e}")))?;
        metadata.insert(TASK_ID_KEY, task_id);
        metadata.insert(FROM_HOST_KEY, from_host);
        Ok(())
    }

    /// Parse the header from incoming request metadata.
    pub fn from_metadata(metadata: &MetadataMap) -> Result<Self, MillError> {
        let task_id = metadata
            .get(TASK_ID_KEY)
            .ok_or_else(|| MillError::InvalidArgument("missing task-id header".to_string()))?
            .to_str()
            .map_err(|e| MillError::InvalidArgument(format!("bad task-id header: {e}")))?;
        let from_host = metadata
            .get(FROM_HOST_KEY)
            .ok_or_else(|| MillError::InvalidArgument("missing from-host header".to_string()))?
            .to_str()
            .map_err(|e| MillError::InvalidArgument(format!("bad from-host header: {e}")))?;

        let mut parts = task_id.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(job), Some(stage), Some(partition))
                if !job.is_empty() && !stage.is_empty() && !partition.is_empty() =>
            {
                Ok(Self {
                    job_id: job.to_string(),
                    stage_name: stage.to_string(),
                    partition_id: partition.to_string(),
                    from_host: from_host.to_string(),
                })
            }
            _ => Err(MillError::InvalidArgument(format!(
                "malformed task-id header: {task_id}"
            ))),
        }
    }
}

impl From<Row> for v1::Row {
    fn from(row: Row) -> Self {
        Self {
            key: row.key,
            value: row.value,
        }
    }
}

impl From<v1::Row> for Row {
    fn from(row: v1::Row) -> Self {
        Self {
            key: row.key,
            value: row.value,
        }
    }
}

/// Frame a batch of rows for the wire.
pub fn row_batch(rows: Vec<Row>) -> v1::RowBatch {
    v1::RowBatch {
        rows: rows.into_iter().map(Into::into).collect(),
    }
}

/// Unframe a wire batch.
pub fn from_row_batch(batch: v1::RowBatch) -> Vec<Row> {
    batch.rows.into_iter().map(Into::into).collect()
}

/// Map the shared error taxonomy onto gRPC status codes.
pub fn to_status(err: MillError) -> Status {
    match err {
        MillError::InvalidArgument(msg) => Status::invalid_argument(msg),
        MillError::NotFound(msg) => Status::not_found(msg),
        MillError::Unavailable(msg) => Status::unavailable(msg),
        MillError::DialTimeout(host) => Status::unavailable(format!("dial timeout: {host}")),
        MillError::Cancelled => Status::cancelled("cancelled"),
        MillError::TaskFailed(msg) => Status::aborted(msg),
        MillError::LeaseDenied(msg) => Status::unavailable(format!("lease denied: {msg}")),
        MillError::Internal(msg) => Status::internal(msg),
        MillError::Io(e) => Status::internal(e.to_string()),
    }
}

/// Map a gRPC status back into the shared taxonomy.
pub fn from_status(status: Status) -> MillError {
    match status.code() {
        Code::InvalidArgument => MillError::InvalidArgument(status.message().to_string()),
        Code::NotFound => MillError::NotFound(status.message().to_string()),
        Code::Unavailable => MillError::Unavailable(status.message().to_string()),
        Code::Cancelled => MillError::Cancelled,
        Code::Aborted => MillError::TaskFailed(status.message().to_string()),
        _ => MillError::Internal(status.message().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_metadata() {
        let header = DataHeader {
            job_id: "J1".to_string(),
            stage_name: "map".to_string(),
            partition_id: "3".to_string(),
            from_host: "10.0.0.1:7466".to_string(),
        };
        let mut metadata = MetadataMap::new();
        header.apply(&mut metadata).expect("apply");
        assert_eq!(metadata.get(TASK_ID_KEY).unwrap(), "J1/map/3");

        let parsed = DataHeader::from_metadata(&metadata).expect("parse");
        assert_eq!(parsed, header);
    }

    #[test]
    fn missing_or_malformed_headers_are_invalid_argument() {
        let empty = MetadataMap::new();
        assert!(matches!(
            DataHeader::from_metadata(&empty),
            Err(MillError::InvalidArgument(_))
        ));

        let mut partial = MetadataMap::new();
        partial.insert(TASK_ID_KEY, "J1-no-slashes".parse().unwrap());
        partial.insert(FROM_HOST_KEY, "h".parse().unwrap());
        assert!(matches!(
            DataHeader::from_metadata(&partial),
            Err(MillError::InvalidArgument(_))
        ));
    }

    #[test]
    fn row_batches_round_trip() {
        let rows = vec![Row::new("a", b"1".to_vec()), Row::new("b", b"2".to_vec())];
        let back = from_row_batch(row_batch(rows.clone()));
        assert_eq!(back, rows);
    }

    #[test]
    fn status_mapping_is_faithful() {
        let status = to_status(MillError::InvalidArgument("bad header".to_string()));
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(matches!(
            from_status(status),
            MillError::InvalidArgument(_)
        ));
        assert_eq!(to_status(MillError::Cancelled).code(), Code::Cancelled);
        assert_eq!(
            to_status(MillError::DialTimeout("h".to_string())).code(),
            Code::Unavailable
        );
    }
}
