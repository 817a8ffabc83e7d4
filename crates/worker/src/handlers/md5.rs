use async_trait::async_trait;
use tracing::{info, warn};

use archiver_domain::{parse_payload, ArchiverResult, Md5Request, Md5Update, QueueStatus, Task};

use super::{HandlerContext, TaskHandler};
use crate::command::CommandSpec;

pub const MD5_PROGRAM: &str = "md5sum";

pub struct Md5Handler;

#[async_trait]
impl TaskHandler for Md5Handler {
    fn name(&self) -> &'static str {
        "md5"
    }

    async fn handle(&self, ctx: &HandlerContext, task: &Task) -> ArchiverResult<bool> {
        let request: Md5Request = parse_payload(self.name(), task.data.clone())?;
        let spec = CommandSpec::new(MD5_PROGRAM).arg(&request.file_path);

        let digest = match ctx.runner.run_checked(&spec).await {
            Ok(output) => output.stdout.split_whitespace().next().map(str::to_string),
            Err(e) => {
                warn!(md5_queue_id = request.md5_queue_id, error = %e, "计算md5失败");
                None
            }
        };

        match digest {
            Some(md5sum) => {
                info!(md5_queue_id = request.md5_queue_id, md5sum = %md5sum, "md5计算完成");
                ctx.control_plane
                    .update_md5_entry(
                        request.md5_queue_id,
                        &Md5Update {
                            queue_status_id: ctx.vocabulary.queue_status(QueueStatus::Complete),
                            md5sum: Some(md5sum),
                        },
                    )
                    .await?;
                Ok(true)
            }
            None => {
                ctx.control_plane
                    .update_md5_entry(
                        request.md5_queue_id,
                        &Md5Update {
                            queue_status_id: ctx.vocabulary.queue_status(QueueStatus::Failed),
                            md5sum: None,
                        },
                    )
                    .await?;
                Ok(false)
            }
        }
    }
}
