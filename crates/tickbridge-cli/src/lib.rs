// Copyright 2025 tickbridge Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # tickbridge CLI
//!
//! Runs a JavaScript file against a bridge backed by the HTTP transport.
//!
//! ## Architecture
//!
//! The binary parses its flags with `argh`, resolves a [`BridgeConfig`]
//! through [`ConfigOverrides`], and hands over to [`run::run`], which owns
//! the script host on the main thread and ticks it until the script is idle,
//! a tick limit is reached, or the process is interrupted.
//!
//! [`BridgeConfig`]: tickbridge_common::BridgeConfig
//! [`ConfigOverrides`]: run::ConfigOverrides

pub mod run;
