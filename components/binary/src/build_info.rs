// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
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

mod built {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const AUTHOR: &str = built::PKG_AUTHORS;

const COMMIT: &str = match built::GIT_COMMIT_HASH_SHORT {
    Some(hash) => hash,
    None => "",
};

const DIRTY: &str = match built::GIT_DIRTY {
    Some(true) => "-dirty",
    _ => "",
};

/// The cargo version, tagged with the commit for builds made outside a
/// release (`DEDUPE_RELEASE` unset).
pub const FULL_VERSION: &str = match (option_env!("DEDUPE_RELEASE"), COMMIT.is_empty()) {
    (Some(_), _) => built::PKG_VERSION,
    (None, true) => const_format::concatcp!(built::PKG_VERSION, "-unofficial"),
    (None, false) => const_format::concatcp!(built::PKG_VERSION, "-unofficial+", COMMIT, DIRTY),
};

/// `--version` plus what the binary was built with.
pub const LONG_VERSION: &str = const_format::concatcp!(
    FULL_VERSION,
    "\ntarget: ",
    built::TARGET,
    "\nprofile: ",
    built::PROFILE,
    "\nrustc: ",
    built::RUSTC_VERSION,
);
