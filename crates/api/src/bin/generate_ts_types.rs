// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

// Allowed: This is a CLI code generation tool, not server code.
// Using println! for progress output is appropriate here.
#![allow(clippy::disallowed_macros)]

use std::fs;
use std::path::Path;

use rtcbridge_api::{
    CommandRequest, EventPayload, HostControl, MessageType, RegistryStats, RequestPayload,
    ResponsePayload,
};
use ts_rs::TS;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let declarations = [
        format!("// rtcbridge-api\nexport {}", MessageType::decl()),
        format!("export {}", HostControl::decl()),
        format!("export {}", CommandRequest::decl()),
        format!("export {}", RequestPayload::decl()),
        format!("export {}", ResponsePayload::decl()),
        format!("export {}", EventPayload::decl()),
        format!("export {}", RegistryStats::decl()),
    ];

    let output = declarations.join("\n\n");
    let content = format!(
        "// This file is auto-generated. Do not edit it manually.\n\n\
         export type JsonValue = unknown;\n\n{output}\n"
    );

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let workspace_root = manifest_dir
        .parent()
        .and_then(|parent| parent.parent())
        .ok_or("Failed to find workspace root from CARGO_MANIFEST_DIR")?;
    let output_dir = workspace_root.join("bindings");
    fs::create_dir_all(&output_dir)?;
    let output_path = output_dir.join("api-types.ts");

    println!("Writing TypeScript bindings to: {}", output_path.display());

    fs::write(&output_path, content)?;

    println!("TypeScript bindings generated successfully.");

    Ok(())
}
