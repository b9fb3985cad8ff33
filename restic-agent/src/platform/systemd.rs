//! systemd timer backend: `restic-<job>.service` plus `restic-<job>.timer`.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, warn};

use super::files::{read_dir_optional, read_optional, remove_optional, write_atomic};
use super::{header, is_managed, run_command_line, ConfigStore, SchedulerBackend};
use crate::model::schedule::{day_of_week_names, day_variants};
use crate::model::{ScheduledEntry, ValidJob};
use crate::render::MANAGED_HEADER;
use crate::utils::errors::ReconciliationError;
use crate::{AgentError, Result};

const UNIT_PREFIX: &str = "restic-";

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

pub struct SystemdTimers {
    unit_dir: PathBuf,
    configs: ConfigStore,
    command: Vec<String>,
    manage_units: bool,
}

impl SystemdTimers {
    pub fn new(unit_dir: PathBuf, configs: ConfigStore, command: Vec<String>, manage_units: bool) -> Self {
        Self {
            unit_dir,
            configs,
            command,
            manage_units,
        }
    }

    fn unit_path(&self, name: &str, kind: &str) -> PathBuf {
        self.unit_dir.join(format!("{}{}.{}", UNIT_PREFIX, name, kind))
    }

    fn render_service(&self, job: &ValidJob) -> String {
        format!(
            "{header}\n# job: {name}\n# schedule: {schedule}\n\
             [Unit]\n\
             Description=restic backup job {name}\n\
             Wants=network-online.target\n\
             After=network-online.target\n\
             \n\
             [Service]\n\
             Type=oneshot\n\
             EnvironmentFile={env}\n\
             ExecStart={exec}\n",
            header = MANAGED_HEADER,
            name = job.name,
            schedule = job.schedule.expression(),
            env = self.configs.path(&job.name).display(),
            exec = run_command_line(&self.command, &job.name),
        )
    }

    fn render_timer(&self, job: &ValidJob, on_calendar: &[String]) -> String {
        let on_calendar: String = on_calendar
            .iter()
            .map(|value| format!("OnCalendar={}\n", value))
            .collect();
        format!(
            "{header}\n# job: {name}\n# schedule: {schedule}\n\
             [Unit]\n\
             Description=Schedule for restic backup job {name}\n\
             \n\
             [Timer]\n\
             {on_calendar}\
             Persistent=true\n\
             \n\
             [Install]\n\
             WantedBy=timers.target\n",
            header = MANAGED_HEADER,
            name = job.name,
            schedule = job.schedule.expression(),
            on_calendar = on_calendar,
        )
    }

    async fn systemctl(&self, args: &[&str]) -> Result<()> {
        if !self.manage_units {
            return Ok(());
        }
        debug!(?args, "Running systemctl");
        let output = Command::new("systemctl").args(args).output().await?;
        if !output.status.success() {
            return Err(AgentError::Platform(format!(
                "systemctl {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SchedulerBackend for SystemdTimers {
    fn name(&self) -> &'static str {
        "systemd"
    }

    async fn list(&self) -> std::result::Result<BTreeMap<String, ScheduledEntry>, ReconciliationError> {
        let err = |e: std::io::Error| ReconciliationError::ScheduledEntries(e.to_string());
        let mut entries = BTreeMap::new();

        if let Some(mut dir) = read_dir_optional(&self.unit_dir).await.map_err(err)? {
            while let Some(entry) = dir.next_entry().await.map_err(err)? {
                let file_name = entry.file_name().to_string_lossy().to_string();
                if !(file_name.starts_with(UNIT_PREFIX) && file_name.ends_with(".timer")) {
                    continue;
                }
                let Some(content) = read_optional(&entry.path()).await.map_err(err)? else {
                    continue;
                };
                if !is_managed(&content) {
                    continue;
                }
                if let Some(name) = header(&content, "job") {
                    let schedule = header(&content, "schedule").unwrap_or_default().to_string();
                    let config = self.configs.read(name).await.map_err(err)?;
                    entries.insert(name.to_string(), ScheduledEntry { schedule, config });
                }
            }
        }

        // a config without a timer is half-applied; report it so it is repaired or removed
        for name in self.configs.names().await.map_err(err)? {
            if !entries.contains_key(&name) {
                let config = self.configs.read(&name).await.map_err(err)?;
                entries.insert(name, ScheduledEntry { schedule: String::new(), config });
            }
        }
        Ok(entries)
    }

    async fn write_config(&self, job: &ValidJob) -> Result<()> {
        self.configs.write(job).await?;
        Ok(())
    }

    async fn schedule(&self, job: &ValidJob) -> Result<()> {
        let on_calendar = on_calendar(job.schedule.expression()).map_err(|reason| {
            AgentError::Platform(format!("job {}: cannot express schedule as a timer: {}", job.name, reason))
        })?;

        write_atomic(&self.unit_path(&job.name, "service"), &self.render_service(job)).await?;
        write_atomic(&self.unit_path(&job.name, "timer"), &self.render_timer(job, &on_calendar)).await?;

        let timer = format!("{}{}.timer", UNIT_PREFIX, job.name);
        self.systemctl(&["daemon-reload"]).await?;
        self.systemctl(&["enable", "--now", &timer]).await
    }

    async fn unschedule(&self, name: &str) -> Result<()> {
        let timer = format!("{}{}.timer", UNIT_PREFIX, name);
        if let Err(e) = self.systemctl(&["disable", "--now", &timer]).await {
            warn!(job = %name, error = %e, "Failed to disable timer");
        }

        remove_optional(&self.unit_path(name, "timer")).await?;
        remove_optional(&self.unit_path(name, "service")).await?;
        self.configs.remove(name).await?;
        self.systemctl(&["daemon-reload"]).await
    }
}

/// Translate a five-field cron expression or macro into `OnCalendar=` values.
///
/// cron fires on a day when either a restricted day-of-month or a restricted
/// day-of-week matches. systemd ANDs the two, so that case becomes two values,
/// which a timer ORs.
pub fn on_calendar(expression: &str) -> std::result::Result<Vec<String>, String> {
    let special = match expression {
        "@hourly" => Some("hourly"),
        "@daily" | "@midnight" => Some("daily"),
        // systemd's `weekly` is Monday
        "@weekly" => Some("Sun *-*-* 00:00:00"),
        "@monthly" => Some("monthly"),
        "@yearly" | "@annually" => Some("yearly"),
        _ => None,
    };
    if let Some(value) = special {
        return Ok(vec![value.to_string()]);
    }

    let fields: Vec<&str> = expression.split_whitespace().collect();
    let [minute, hour, day, month, weekday] = fields[..] else {
        return Err(format!("expected 5 fields, found {}", fields.len()));
    };

    let minute = calendar_field(minute, 0, true)?;
    let hour = calendar_field(hour, 0, true)?;
    let month = calendar_field(month, 1, false)?;

    day_variants(day, weekday)
        .into_iter()
        .map(|(day, weekday)| {
            let day = calendar_field(day, 1, false)?;
            let weekday = weekday_prefix(weekday)?;
            Ok(format!("{}*-{}-{} {}:{}:00", weekday, month, day, hour, minute))
        })
        .collect()
}

fn weekday_prefix(weekday: &str) -> std::result::Result<String, String> {
    if weekday.contains('/') {
        return Err(format!("day-of-week step \"{}\"", weekday));
    }
    let names = if weekday == "*" {
        "*".to_string()
    } else {
        day_of_week_names(weekday)?
    };
    // 0-7 and friends cover the whole week
    if names == "*" {
        return Ok(String::new());
    }
    Ok(format!("{} ", names.replace('-', "..")))
}

fn calendar_field(field: &str, first: u32, pad: bool) -> std::result::Result<String, String> {
    let items = field
        .split(',')
        .map(|item| {
            let (base, step) = match item.split_once('/') {
                Some((base, step)) => (base, Some(step)),
                None => (item, None),
            };
            match (base, step) {
                ("*", None) => Ok("*".to_string()),
                ("*", Some(step)) => Ok(format!("{}/{}", calendar_value(&first.to_string(), pad)?, step)),
                (base, Some(_)) if base.contains('-') => {
                    Err(format!("stepped range \"{}\"", item))
                }
                (base, Some(step)) => Ok(format!("{}/{}", calendar_value(base, pad)?, step)),
                (base, None) => match base.split_once('-') {
                    Some((start, end)) => Ok(format!(
                        "{}..{}",
                        calendar_value(start, pad)?,
                        calendar_value(end, pad)?
                    )),
                    None => calendar_value(base, pad),
                },
            }
        })
        .collect::<std::result::Result<Vec<_>, String>>()?;
    Ok(items.join(","))
}

fn calendar_value(value: &str, pad: bool) -> std::result::Result<String, String> {
    let number = match value.parse::<u32>() {
        Ok(n) => n,
        Err(_) => {
            let lower = value.to_ascii_lowercase();
            MONTH_NAMES
                .iter()
                .position(|m| *m == lower)
                .map(|i| i as u32 + 1)
                .ok_or_else(|| format!("unsupported value \"{}\"", value))?
        }
    };
    Ok(if pad {
        format!("{:02}", number)
    } else {
        number.to_string()
    })
}
