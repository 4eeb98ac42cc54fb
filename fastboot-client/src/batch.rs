use std::path::PathBuf;

use tracing::{info, warn};

use crate::client::FastbootClient;
use crate::error::Error;
use crate::progress::{Progress, Stage};

/// What a task does to its target
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TaskOperation {
    Flash,
    Erase,
    SetActive,
    Reboot,
}

/// One step of a flashing run, as produced by a flash-script parser
#[derive(Debug, Clone)]
pub struct FlashTask {
    pub operation: TaskOperation,
    /// Partition to flash or erase, slot to activate; empty for reboot
    pub target: String,
    pub image: Option<PathBuf>,
    /// Further arguments from the source script, preserved verbatim
    pub extra: Option<String>,
    /// The script line this task came from
    pub source_line: String,
}

impl FlashTask {
    pub fn flash(target: &str, image: PathBuf, source_line: &str) -> Self {
        Self {
            operation: TaskOperation::Flash,
            target: target.to_string(),
            image: Some(image),
            extra: None,
            source_line: source_line.to_string(),
        }
    }

    pub fn erase(target: &str, source_line: &str) -> Self {
        Self {
            operation: TaskOperation::Erase,
            target: target.to_string(),
            image: None,
            extra: None,
            source_line: source_line.to_string(),
        }
    }
}

/// Progress of a task list run
#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub task_index: usize,
    pub task_count: usize,
    /// Task progress folded into the whole run, in [0, 100]
    pub overall_percent: f64,
    pub task: Progress,
}

/// A failed task in the summary
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub index: usize,
    pub target: String,
    /// Stable error kind, see [Error::kind]
    pub kind: &'static str,
    pub message: String,
    /// The device's FAIL reason verbatim, when it rejected the command
    pub device_message: Option<String>,
}

/// Outcome of a task list run
#[derive(Debug, Clone, Default)]
pub struct FlashSummary {
    pub succeeded: usize,
    pub failed: Vec<TaskFailure>,
    pub first_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    /// Keep going after a failed task; cancellation always aborts
    pub continue_on_error: bool,
}

fn completed_task(target: &str) -> Progress {
    Progress {
        partition: target.to_string(),
        stage: Stage::Done,
        current_chunk: 1,
        total_chunks: 1,
        bytes_sent: 0,
        total_bytes: 0,
        percent: 100.0,
        speed_bps: 0,
    }
}

/// Run a task list against a client
///
/// Tasks execute in order; per-task progress is folded into an overall
/// percentage. A failure is recorded and, depending on
/// [BatchOptions::continue_on_error], aborts the remainder.
pub async fn run_tasks<F>(
    client: &mut FastbootClient,
    tasks: &[FlashTask],
    options: &BatchOptions,
    mut progress: F,
) -> FlashSummary
where
    F: FnMut(BatchProgress),
{
    let count = tasks.len();
    let mut summary = FlashSummary::default();

    for (index, task) in tasks.iter().enumerate() {
        info!(
            "Task {}/{}: {:?} {}",
            index + 1,
            count,
            task.operation,
            task.target
        );
        let result = match task.operation {
            TaskOperation::Flash => match &task.image {
                Some(image) => {
                    client
                        .flash_partition(&task.target, image, |p| {
                            let overall =
                                (index as f64 + p.percent / 100.0) / count as f64 * 100.0;
                            progress(BatchProgress {
                                task_index: index,
                                task_count: count,
                                overall_percent: overall,
                                task: p,
                            });
                        })
                        .await
                }
                None => Err(Error::MissingImage(task.source_line.clone())),
            },
            TaskOperation::Erase => client.erase(&task.target).await,
            TaskOperation::SetActive => client.set_active(&task.target).await,
            TaskOperation::Reboot => client.reboot().await,
        };

        match result {
            Ok(()) => {
                summary.succeeded += 1;
                if task.operation != TaskOperation::Flash {
                    progress(BatchProgress {
                        task_index: index,
                        task_count: count,
                        overall_percent: (index + 1) as f64 / count as f64 * 100.0,
                        task: completed_task(&task.target),
                    });
                }
            }
            Err(e) => {
                warn!("Task {:?} failed: {e}", task.source_line);
                if summary.first_error.is_none() {
                    summary.first_error = Some(format!("{}: {e}", task.source_line));
                }
                let abort = matches!(e, Error::Cancelled) || !options.continue_on_error;
                summary.failed.push(TaskFailure {
                    index,
                    target: task.target.clone(),
                    kind: e.kind(),
                    message: e.to_string(),
                    device_message: match e {
                        Error::DeviceRejected { message } => Some(message),
                        _ => None,
                    },
                });
                if abort {
                    break;
                }
            }
        }
    }
    summary
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{scripted, Step};
    use crate::FastbootClient;

    fn erase_task(target: &str) -> FlashTask {
        FlashTask::erase(target, &format!("fastboot erase {target}"))
    }

    #[tokio::test]
    async fn tasks_run_in_order() {
        let (transport, sim) = scripted(vec![
            Step::Command("erase:cache".into()),
            Step::Reply("OKAY".into()),
            Step::Command("set_active:a".into()),
            Step::Reply("OKAY".into()),
        ]);
        let mut client = FastbootClient::new(transport);

        let tasks = [
            erase_task("cache"),
            FlashTask {
                operation: TaskOperation::SetActive,
                target: "a".into(),
                image: None,
                extra: None,
                source_line: "fastboot set_active a".into(),
            },
        ];
        let mut overall = vec![];
        let summary = run_tasks(&mut client, &tasks, &BatchOptions::default(), |p| {
            overall.push(p.overall_percent)
        })
        .await;

        assert_eq!(summary.succeeded, 2);
        assert!(summary.failed.is_empty());
        assert!(summary.first_error.is_none());
        assert_eq!(sim.steps_left(), 0);
        assert!(overall.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(overall.last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn failure_aborts_by_default() {
        let (transport, sim) = scripted(vec![
            Step::Command("erase:userdata".into()),
            Step::Reply("FAILerase is not allowed in locked state".into()),
            Step::Command("erase:cache".into()),
            Step::Reply("OKAY".into()),
        ]);
        let mut client = FastbootClient::new(transport);

        let tasks = [erase_task("userdata"), erase_task("cache")];
        let summary = run_tasks(&mut client, &tasks, &BatchOptions::default(), |_| ()).await;

        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].kind, "device-rejected");
        assert_eq!(
            summary.failed[0].device_message.as_deref(),
            Some("erase is not allowed in locked state")
        );
        assert!(summary.first_error.is_some());
        // The second task never ran
        assert_eq!(sim.steps_left(), 2);
    }

    #[tokio::test]
    async fn failure_continues_when_asked() {
        let (transport, sim) = scripted(vec![
            Step::Command("erase:userdata".into()),
            Step::Reply("FAILno".into()),
            Step::Command("erase:cache".into()),
            Step::Reply("OKAY".into()),
        ]);
        let mut client = FastbootClient::new(transport);

        let options = BatchOptions {
            continue_on_error: true,
        };
        let tasks = [erase_task("userdata"), erase_task("cache")];
        let summary = run_tasks(&mut client, &tasks, &options, |_| ()).await;

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(sim.steps_left(), 0);
    }

    #[tokio::test]
    async fn cancellation_aborts_despite_continue() {
        let (transport, sim) = scripted(vec![
            Step::Command("erase:a".into()),
            Step::Reply("OKAY".into()),
        ]);
        let mut client = FastbootClient::new(transport);
        client.cancel_token().cancel();

        let options = BatchOptions {
            continue_on_error: true,
        };
        let tasks = [erase_task("a"), erase_task("b")];
        let summary = run_tasks(&mut client, &tasks, &options, |_| ()).await;

        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].kind, "cancelled");
        // Nothing hit the wire
        assert_eq!(sim.steps_left(), 2);
    }

    #[tokio::test]
    async fn flash_without_image_fails() {
        let (transport, _sim) = scripted(vec![]);
        let mut client = FastbootClient::new(transport);

        let tasks = [FlashTask {
            operation: TaskOperation::Flash,
            target: "boot".into(),
            image: None,
            extra: None,
            source_line: "fastboot flash boot".into(),
        }];
        let summary = run_tasks(&mut client, &tasks, &BatchOptions::default(), |_| ()).await;
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].kind, "missing-image");
    }
}
