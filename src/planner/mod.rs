// SPDX-License-Identifier: MIT
//! C2 — Build Planner.
//!
//! Pure, synchronous inference of any [`BuildPlan`] fields left empty by the
//! caller. Same inputs always produce the same outputs; no I/O.

use crate::snapshot::ProjectFile;
use serde::{Deserialize, Serialize};

/// The fully-resolved build configuration, persisted as
/// `Deployment.config_snapshot`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildPlan {
    pub framework: Option<String>,
    pub install_cmd: Option<String>,
    pub build_cmd: Option<String>,
    pub output_dir: Option<String>,
    pub service_type: Option<String>,
    pub runtime_version: Option<String>,
}

/// Evaluation order for framework detection; first match wins.
const FRAMEWORK_ORDER: &[&str] = &[
    "next", "react", "vue", "svelte", "angular", "static", "express", "fastapi", "django",
    "flask", "go", "rust",
];

const STATIC_FRAMEWORKS: &[&str] = &["next", "react", "vue", "svelte", "angular", "static"];

struct FrameworkDefaults {
    install_cmd: &'static str,
    build_cmd: &'static str,
    output_dir: &'static str,
}

fn defaults_for(framework: &str) -> FrameworkDefaults {
    match framework {
        "next" => FrameworkDefaults {
            install_cmd: "npm install",
            build_cmd: "npm run build",
            output_dir: ".next",
        },
        "react" => FrameworkDefaults {
            install_cmd: "npm install",
            build_cmd: "npm run build",
            output_dir: "build",
        },
        "vue" => FrameworkDefaults {
            install_cmd: "npm install",
            build_cmd: "npm run build",
            output_dir: "dist",
        },
        "svelte" => FrameworkDefaults {
            install_cmd: "npm install",
            build_cmd: "npm run build",
            output_dir: "public/build",
        },
        "angular" => FrameworkDefaults {
            install_cmd: "npm install",
            build_cmd: "npm run build",
            output_dir: "dist",
        },
        "static" => FrameworkDefaults {
            install_cmd: "",
            build_cmd: "",
            output_dir: ".",
        },
        "express" => FrameworkDefaults {
            install_cmd: "npm install",
            build_cmd: "",
            output_dir: ".",
        },
        "fastapi" => FrameworkDefaults {
            install_cmd: "pip install -r requirements.txt",
            build_cmd: "",
            output_dir: ".",
        },
        "django" => FrameworkDefaults {
            install_cmd: "pip install -r requirements.txt",
            build_cmd: "python manage.py collectstatic --noinput",
            output_dir: "staticfiles",
        },
        "flask" => FrameworkDefaults {
            install_cmd: "pip install -r requirements.txt",
            build_cmd: "",
            output_dir: ".",
        },
        "go" => FrameworkDefaults {
            install_cmd: "go mod download",
            build_cmd: "go build -o app .",
            output_dir: ".",
        },
        "rust" => FrameworkDefaults {
            install_cmd: "",
            build_cmd: "cargo build --release",
            output_dir: "target/release",
        },
        _ => FrameworkDefaults {
            install_cmd: "",
            build_cmd: "",
            output_dir: ".",
        },
    }
}

/// Detect the framework from manifest hints, then well-known entry files,
/// then extension frequency, per the fixed evaluation order.
fn detect_framework(files: &[ProjectFile]) -> &'static str {
    let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
    let has = |p: &str| paths.iter().any(|x| *x == p || x.ends_with(p));

    // (a) explicit manifest hints.
    if let Some(pkg) = files.iter().find(|f| f.path.ends_with("package.json")) {
        let text = String::from_utf8_lossy(&pkg.content);
        for fw in ["next", "react", "vue", "svelte", "angular"] {
            if text.contains(&format!("\"{fw}\"")) {
                return fw;
            }
        }
        if text.contains("\"express\"") {
            return "express";
        }
    }
    if files.iter().any(|f| f.path.ends_with("requirements.txt")) {
        let text = files
            .iter()
            .find(|f| f.path.ends_with("requirements.txt"))
            .map(|f| String::from_utf8_lossy(&f.content).to_lowercase())
            .unwrap_or_default();
        if text.contains("fastapi") {
            return "fastapi";
        }
        if text.contains("django") {
            return "django";
        }
        if text.contains("flask") {
            return "flask";
        }
    }
    if has("go.mod") {
        return "go";
    }
    if has("Cargo.toml") {
        return "rust";
    }

    // (b) well-known entry files.
    if has("next.config.js") || has("next.config.mjs") || has("next.config.ts") {
        return "next";
    }
    if has("vue.config.js") {
        return "vue";
    }
    if has("svelte.config.js") {
        return "svelte";
    }
    if has("angular.json") {
        return "angular";
    }
    if has("manage.py") {
        return "django";
    }
    if has("index.html") && !has("package.json") {
        return "static";
    }

    // (c) extension frequency — counted via a HashMap (iteration order is
    // per-process random), so the winner is picked by scanning
    // FRAMEWORK_ORDER rather than by iterating the map: ties, and the
    // "which extension is even eligible" question, are both resolved by
    // position in that fixed list instead of hash order.
    let mut counts = std::collections::HashMap::new();
    for p in &paths {
        if let Some(ext) = p.rsplit('.').next() {
            *counts.entry(ext).or_insert(0u32) += 1;
        }
    }
    let extension_for = |framework: &str| -> Option<&'static str> {
        match framework {
            "rust" => Some("rs"),
            "go" => Some("go"),
            "flask" => Some("py"),
            "static" => Some("html"),
            _ => None,
        }
    };
    let max_count = FRAMEWORK_ORDER
        .iter()
        .filter_map(|fw| extension_for(fw).and_then(|ext| counts.get(ext).copied()))
        .max();
    let dominant = match max_count {
        Some(max) if max > 0 => FRAMEWORK_ORDER
            .iter()
            .find(|fw| extension_for(fw).and_then(|ext| counts.get(ext).copied()) == Some(max))
            .copied(),
        _ => None,
    };
    dominant.unwrap_or(FRAMEWORK_ORDER[0])
}

fn service_type_for(framework: &str) -> &'static str {
    if STATIC_FRAMEWORKS.contains(&framework) {
        "static"
    } else {
        "web"
    }
}

/// Fill in any `None` field of `user_plan` with an inferred default.
/// Pure: identical `(user_plan, files)` always yields an identical result.
pub fn infer_missing(user_plan: &BuildPlan, files: &[ProjectFile]) -> BuildPlan {
    let framework = user_plan
        .framework
        .clone()
        .unwrap_or_else(|| detect_framework(files).to_string());
    let defaults = defaults_for(&framework);

    BuildPlan {
        framework: Some(framework.clone()),
        install_cmd: user_plan
            .install_cmd
            .clone()
            .or_else(|| Some(defaults.install_cmd.to_string())),
        build_cmd: user_plan
            .build_cmd
            .clone()
            .or_else(|| Some(defaults.build_cmd.to_string())),
        output_dir: user_plan
            .output_dir
            .clone()
            .or_else(|| Some(defaults.output_dir.to_string())),
        service_type: user_plan
            .service_type
            .clone()
            .or_else(|| Some(service_type_for(&framework).to_string())),
        runtime_version: user_plan.runtime_version.clone(),
    }
}
