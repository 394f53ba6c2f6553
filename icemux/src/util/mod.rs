// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod framed;
pub mod interfaces;
pub mod liveness;
