//! Batch and Request state machines
//!
//! Pure declarations: the state enums, their terminal sets, and the fixed
//! legal-transition tables. The store layer enforces these on every write
//! and records one audit row per transition; nothing else in the codebase
//! mutates `state` columns directly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Batch states
// ============================================================================

/// Lifecycle state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Building,
    Uploading,
    Uploaded,
    WaitingForCapacity,
    OpenaiProcessing,
    OpenaiCompleted,
    Downloading,
    ReadyToDeliver,
    Delivering,
    Delivered,
    PartiallyDelivered,
    DeliveryFailed,
    Expired,
    Failed,
    Cancelled,
    Done,
}

impl BatchState {
    pub const ALL: [BatchState; 16] = [
        BatchState::Building,
        BatchState::Uploading,
        BatchState::Uploaded,
        BatchState::WaitingForCapacity,
        BatchState::OpenaiProcessing,
        BatchState::OpenaiCompleted,
        BatchState::Downloading,
        BatchState::ReadyToDeliver,
        BatchState::Delivering,
        BatchState::Delivered,
        BatchState::PartiallyDelivered,
        BatchState::DeliveryFailed,
        BatchState::Expired,
        BatchState::Failed,
        BatchState::Cancelled,
        BatchState::Done,
    ];

    /// States from which no further transition is legal, except the
    /// documented redeliver re-entry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchState::Delivered
                | BatchState::PartiallyDelivered
                | BatchState::DeliveryFailed
                | BatchState::Failed
                | BatchState::Cancelled
                | BatchState::Done
        )
    }

    /// States whose batches occupy provider queue slots for their model.
    /// Admission sums `estimated_input_tokens_total` over these.
    pub fn holds_capacity(self) -> bool {
        matches!(
            self,
            BatchState::OpenaiProcessing
                | BatchState::OpenaiCompleted
                | BatchState::Downloading
                | BatchState::ReadyToDeliver
                | BatchState::Delivering
        )
    }

    /// Legal state transitions for a batch.
    ///
    /// `expired -> uploading` is the partial-expiration resubmission path;
    /// `openai_processing -> waiting_for_capacity` is the token-limit retry
    /// path; the three delivery-terminal states re-enter `delivering` on
    /// operator redeliver.
    pub fn can_transition_to(self, to: BatchState) -> bool {
        use BatchState::*;
        // Operator cancel is legal from every pre-terminal state.
        if to == Cancelled && !self.is_terminal() {
            return true;
        }
        // A step whose retries exhaust surfaces as failed.
        if to == Failed
            && matches!(
                self,
                Uploading
                    | Uploaded
                    | WaitingForCapacity
                    | OpenaiProcessing
                    | OpenaiCompleted
                    | Downloading
                    | Expired
            )
        {
            return true;
        }
        match (self, to) {
            (Building, Uploading) => true,
            (Uploading, Uploaded) => true,
            (Uploaded, OpenaiProcessing) => true,
            (Uploaded, WaitingForCapacity) => true,
            (WaitingForCapacity, OpenaiProcessing) => true,
            (OpenaiProcessing, OpenaiCompleted) => true,
            (OpenaiProcessing, Expired) => true,
            (OpenaiProcessing, WaitingForCapacity) => true,
            (OpenaiCompleted, Downloading) => true,
            (Downloading, ReadyToDeliver) => true,
            (ReadyToDeliver, Delivering) => true,
            (Delivering, Delivered) => true,
            (Delivering, PartiallyDelivered) => true,
            (Delivering, DeliveryFailed) => true,
            (Expired, Uploading) => true,
            (Expired, Delivered) => true,
            (Expired, PartiallyDelivered) => true,
            (Expired, DeliveryFailed) => true,
            (Expired, Delivering) => true,
            // Redeliver
            (Delivered, Delivering) => true,
            (PartiallyDelivered, Delivering) => true,
            (DeliveryFailed, Delivering) => true,
            _ => false,
        }
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchState::Building => "building",
            BatchState::Uploading => "uploading",
            BatchState::Uploaded => "uploaded",
            BatchState::WaitingForCapacity => "waiting_for_capacity",
            BatchState::OpenaiProcessing => "openai_processing",
            BatchState::OpenaiCompleted => "openai_completed",
            BatchState::Downloading => "downloading",
            BatchState::ReadyToDeliver => "ready_to_deliver",
            BatchState::Delivering => "delivering",
            BatchState::Delivered => "delivered",
            BatchState::PartiallyDelivered => "partially_delivered",
            BatchState::DeliveryFailed => "delivery_failed",
            BatchState::Expired => "expired",
            BatchState::Failed => "failed",
            BatchState::Cancelled => "cancelled",
            BatchState::Done => "done",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for BatchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "building" => Ok(BatchState::Building),
            "uploading" => Ok(BatchState::Uploading),
            "uploaded" => Ok(BatchState::Uploaded),
            "waiting_for_capacity" => Ok(BatchState::WaitingForCapacity),
            "openai_processing" => Ok(BatchState::OpenaiProcessing),
            "openai_completed" => Ok(BatchState::OpenaiCompleted),
            "downloading" => Ok(BatchState::Downloading),
            "ready_to_deliver" => Ok(BatchState::ReadyToDeliver),
            "delivering" => Ok(BatchState::Delivering),
            "delivered" => Ok(BatchState::Delivered),
            "partially_delivered" => Ok(BatchState::PartiallyDelivered),
            "delivery_failed" => Ok(BatchState::DeliveryFailed),
            "expired" => Ok(BatchState::Expired),
            "failed" => Ok(BatchState::Failed),
            "cancelled" => Ok(BatchState::Cancelled),
            "done" => Ok(BatchState::Done),
            other => Err(format!("unknown batch state: {}", other)),
        }
    }
}

// ============================================================================
// Request states
// ============================================================================

/// Lifecycle state of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    OpenaiProcessing,
    OpenaiProcessed,
    Delivering,
    Delivered,
    Failed,
    DeliveryFailed,
    Expired,
    Cancelled,
}

impl RequestState {
    pub const ALL: [RequestState; 9] = [
        RequestState::Pending,
        RequestState::OpenaiProcessing,
        RequestState::OpenaiProcessed,
        RequestState::Delivering,
        RequestState::Delivered,
        RequestState::Failed,
        RequestState::DeliveryFailed,
        RequestState::Expired,
        RequestState::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Delivered
                | RequestState::Failed
                | RequestState::DeliveryFailed
                | RequestState::Expired
                | RequestState::Cancelled
        )
    }

    /// States in which `response_payload` must be present.
    pub fn has_response(self) -> bool {
        matches!(
            self,
            RequestState::OpenaiProcessed
                | RequestState::Delivering
                | RequestState::Delivered
                | RequestState::DeliveryFailed
        )
    }

    /// Legal state transitions for a request.
    ///
    /// `delivered -> openai_processed` and `delivery_failed ->
    /// openai_processed` are the retry_delivery path; delivery is
    /// at-least-once by design.
    pub fn can_transition_to(self, to: RequestState) -> bool {
        use RequestState::*;
        if to == Cancelled
            && matches!(self, Pending | OpenaiProcessing | OpenaiProcessed | Delivering)
        {
            return true;
        }
        match (self, to) {
            (Pending, OpenaiProcessing) => true,
            (OpenaiProcessing, OpenaiProcessed) => true,
            (OpenaiProcessing, Pending) => true,
            (OpenaiProcessing, Failed) => true,
            (OpenaiProcessing, Expired) => true,
            (OpenaiProcessed, Delivering) => true,
            (Delivering, Delivered) => true,
            (Delivering, DeliveryFailed) => true,
            // retry_delivery
            (OpenaiProcessed, OpenaiProcessed) => true,
            (Delivered, OpenaiProcessed) => true,
            (DeliveryFailed, OpenaiProcessed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestState::Pending => "pending",
            RequestState::OpenaiProcessing => "openai_processing",
            RequestState::OpenaiProcessed => "openai_processed",
            RequestState::Delivering => "delivering",
            RequestState::Delivered => "delivered",
            RequestState::Failed => "failed",
            RequestState::DeliveryFailed => "delivery_failed",
            RequestState::Expired => "expired",
            RequestState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for RequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestState::Pending),
            "openai_processing" => Ok(RequestState::OpenaiProcessing),
            "openai_processed" => Ok(RequestState::OpenaiProcessed),
            "delivering" => Ok(RequestState::Delivering),
            "delivered" => Ok(RequestState::Delivered),
            "failed" => Ok(RequestState::Failed),
            "delivery_failed" => Ok(RequestState::DeliveryFailed),
            "expired" => Ok(RequestState::Expired),
            "cancelled" => Ok(RequestState::Cancelled),
            other => Err(format!("unknown request state: {}", other)),
        }
    }
}
