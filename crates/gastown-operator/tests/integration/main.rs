/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */


mod backoff;
mod crds;
mod health;
mod merge_queue;
mod polecat;
mod rig;
mod witness;
