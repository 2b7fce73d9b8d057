use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;

use crate::config::AppConfig;
use crate::core::DiscBackend;
use crate::core::models::{Device, JobProgress, MediaInfo};

pub mod simulated;
pub mod xorriso;

pub use simulated::{Operation, SimulatedBackend, Simulator};
pub use xorriso::XorrisoBackend;

pub fn get_backend(config: &AppConfig) -> Arc<dyn DiscBackend> {
    if config.simulation {
        let (backend, controller) = SimulatedBackend::new();
        controller.add_device(simulated_drive("/dev/sr0"));
        controller.insert_media("/dev/sr0", simulated_media("dvd"));

        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lines().map_while(Result::ok) {
                match ConsoleCommand::parse(&line) {
                    Ok(cmd) => cmd.run(&controller),
                    Err(usage) => println!("(Simulator) {usage}"),
                }
            }
        });

        info!("Using simulated backend; type commands on stdin");
        return Arc::new(backend);
    }

    Arc::new(XorrisoBackend::new(xorriso::XorrisoConfig::from(config)))
}

const USAGE: &str = "Use: 'add <path>', 'rm <path>', 'insert <path> [cd|dvd|bd]', \
                     'progress <percent> [phase]', 'complete', 'fail <message>'";

/// Commands typed into the simulator console.
#[derive(Debug, PartialEq)]
enum ConsoleCommand {
    Add(String),
    Remove(String),
    Insert { path: String, kind: String },
    Progress { percent: f64, phase: String },
    Complete,
    Fail(String),
}

impl ConsoleCommand {
    fn parse(line: &str) -> Result<Self, &'static str> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let arg = |i: usize| parts.get(i).map(|s| s.to_string());

        match parts.first().copied() {
            Some("add") => Ok(Self::Add(arg(1).unwrap_or_else(|| "/dev/sr1".into()))),
            Some("rm") => arg(1).map(Self::Remove).ok_or(USAGE),
            Some("insert") => Ok(Self::Insert {
                path: arg(1).ok_or(USAGE)?,
                kind: arg(2).unwrap_or_else(|| "dvd".into()),
            }),
            Some("progress") => Ok(Self::Progress {
                percent: parts
                    .get(1)
                    .and_then(|p| p.parse().ok())
                    .ok_or(USAGE)?,
                phase: arg(2).unwrap_or_else(|| "burning".into()),
            }),
            Some("complete") => Ok(Self::Complete),
            Some("fail") => Ok(Self::Fail(if parts.len() > 1 {
                parts[1..].join(" ")
            } else {
                "simulated failure".into()
            })),
            _ => Err(USAGE),
        }
    }

    fn run(self, controller: &Simulator) {
        match self {
            Self::Add(path) => controller.add_device(simulated_drive(&path)),
            Self::Remove(path) => controller.remove_device(&path),
            Self::Insert { path, kind } => controller.insert_media(&path, simulated_media(&kind)),
            Self::Progress { percent, phase } => {
                let Some(id) = controller.active_job() else {
                    println!("(Simulator) No running job");
                    return;
                };
                let total = 734_003_200u64;
                controller.progress(
                    &id,
                    JobProgress {
                        phase,
                        percent,
                        speed: "8x".into(),
                        bytes_written: (total as f64 * percent / 100.0) as u64,
                        bytes_total: total,
                        fifo_fill: 100.0,
                        ..Default::default()
                    },
                );
            }
            Self::Complete => match controller.active_job() {
                Some(id) => {
                    controller.complete(&id, "Operation completed successfully");
                }
                None => println!("(Simulator) No running job"),
            },
            Self::Fail(message) => match controller.active_job() {
                Some(id) => {
                    controller.fail(&id, &message);
                }
                None => println!("(Simulator) No running job"),
            },
        }
    }
}

fn simulated_drive(path: &str) -> Device {
    let index = path.trim_start_matches(|c: char| !c.is_ascii_digit());
    Device {
        path: path.to_string(),
        name: format!("Simulated Writer {index}"),
        vendor: "XBURN".into(),
        model: "SIM-BD-RE".into(),
        capabilities: ["cd-r", "cd-rw", "dvd-r", "dvd+r", "dvd+rw", "bd-r", "bd-re"]
            .into_iter()
            .map(String::from)
            .collect::<BTreeSet<_>>(),
    }
}

fn simulated_media(kind: &str) -> MediaInfo {
    let (media_type, capacity) = match kind {
        "cd" => ("CD-R", 737_280_000),
        "bd" => ("BD-R", 25_025_314_816),
        _ => ("DVD+R", 4_700_372_992),
    };
    MediaInfo {
        media_type: media_type.into(),
        media_status: "blank".into(),
        media_label: String::new(),
        total_capacity: capacity,
        free_space: capacity,
        sessions: 0,
        tracks: 0,
    }
}
