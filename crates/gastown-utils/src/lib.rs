/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

pub mod config;
pub mod telemetry;

pub use config::{ResolvedTelemetry, Settings, Telemetry};
