// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use serde::Deserialize;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    generate_consts()?;

    Ok(())
}

fn generate_consts() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed=REFLEX_KCONFIG");
    let kconfig: KernelConfig = match env::var("REFLEX_KCONFIG") {
        Ok(text) => ron::de::from_str(&text)?,
        Err(env::VarError::NotPresent) => KernelConfig::default(),
        Err(e) => return Err(e.into()),
    };

    let out = &PathBuf::from(env::var_os("OUT_DIR").ok_or("OUT_DIR unset")?);
    let mut file = File::create(out.join("kconfig.rs"))?;

    writeln!(file, "// See build.rs for details")?;
    writeln!(
        file,
        "/// Capacity of the message pool.\n\
         pub const NUM_MESSAGES: usize = {};",
        kconfig.messages
    )?;
    writeln!(
        file,
        "/// Number of worker contexts available to the dynamic kernel.\n\
         pub const NUM_THREADS: usize = {};",
        kconfig.threads
    )?;
    writeln!(
        file,
        "/// Capacity of a message's argument buffer, in bytes.\n\
         pub const ARGS_SIZE: usize = {};",
        kconfig.args_size
    )?;
    writeln!(
        file,
        "/// Stack size requested for each worker context, in bytes.\n\
         pub const STACK_SIZE: usize = {};",
        kconfig.stack_size
    )?;
    writeln!(
        file,
        "/// Number of objects the kernel can track.\n\
         pub const NUM_OBJECTS: usize = {};",
        kconfig.objects
    )?;
    writeln!(
        file,
        "/// Number of entries in each kernel trace ring.\n\
         pub const TRACE_DEPTH: usize = {};",
        kconfig.trace_depth
    )?;

    Ok(())
}

/// Kernel sizing, supplied as a RON `KernelConfig` struct in the
/// `REFLEX_KCONFIG` environment variable. Any field left out takes its
/// default.
#[derive(Deserialize)]
#[serde(default)]
struct KernelConfig {
    messages: usize,
    threads: usize,
    args_size: usize,
    stack_size: usize,
    objects: usize,
    trace_depth: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            messages: 16,
            threads: 4,
            args_size: 8,
            stack_size: 512,
            objects: 16,
            trace_depth: 32,
        }
    }
}
