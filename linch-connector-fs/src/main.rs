// Copyright 2024 Google LLC
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

//! The filesystem connector: watches configured directories and
//! streams change events to the linch-mind daemon.

use liblinch_connector::Args;

mod filesystem;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let args = Args::parse_lenient();

    if args.version() {
        println!("linch-connector-fs {}", VERSION);
        return Ok(());
    }

    liblinch_connector::run(args, Box::new(filesystem::FilesystemConnector::new()))
}
