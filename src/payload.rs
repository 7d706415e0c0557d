// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Job Payloads
//!
//! `publish` wraps job data in a small JSON envelope before it reaches the
//! broker; `publish_raw` skips this step and sends the caller's bytes as is.
//! The queue core never looks inside either form.

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The JSON document published by `publish`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub uuid: String,
    pub display_name: String,
    pub job: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl JobPayload {
    /// Wraps `data` for the job handler named `job`, under a fresh v4 uuid.
    pub fn new<T: Serialize + ?Sized>(job: &str, data: &T) -> Result<JobPayload, AmqpError> {
        Ok(JobPayload {
            uuid: Uuid::new_v4().to_string(),
            display_name: job.to_owned(),
            job: job.to_owned(),
            max_tries: None,
            timeout: None,
            data: serde_json::to_value(data)?,
        })
    }

    pub fn display_name(mut self, name: &str) -> Self {
        self.display_name = name.to_owned();
        self
    }

    pub fn max_tries(mut self, tries: u32) -> Self {
        self.max_tries = Some(tries);
        self
    }

    /// Processing timeout in seconds, for the worker to enforce.
    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, AmqpError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<JobPayload, AmqpError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Deserializes the job data into the handler's type.
    pub fn data_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, AmqpError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}
