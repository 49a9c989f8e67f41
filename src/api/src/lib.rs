// Copyright 2023 The Tessera Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire and metadata types shared by tessera stores and clients.
//!
//! The messages are hand-maintained prost structs so that no protoc step is
//! required at build time; they encode exactly like their upstream protobuf
//! counterparts.

pub mod errorpb;
pub mod metapb;
pub mod rpcpb;
pub mod shard;
