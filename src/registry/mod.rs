//! Publishing a tested image to the registry

use std::io::{BufRead, Write};

#[cfg(test)]
use mockall::automock;
use tracing::{error, info, warn};

use crate::config::PushPolicy;
use crate::error::Result;
use crate::models::PublishOutcome;
use crate::runtime::ContainerRuntime;

const PUSH_TAG: &str = "latest";

/// Yes/no question to the operator
#[cfg_attr(test, automock)]
pub trait Confirm: Send {
    fn confirm(&mut self, question: &str) -> bool;
}

/// Asks on stdout, reads the answer from stdin. Only `y` accepts.
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&mut self, question: &str) -> bool {
        print!("{} y/n: ", question);
        let _ = std::io::stdout().flush();

        let mut answer = String::new();
        match std::io::stdin().lock().read_line(&mut answer) {
            Ok(_) => is_yes(&answer),
            Err(e) => {
                warn!(error = %e, "Could not read answer, assuming no");
                false
            }
        }
    }
}

fn is_yes(answer: &str) -> bool {
    answer.trim().eq_ignore_ascii_case("y")
}

/// Tag, push and untag an image
pub struct Publisher<'a> {
    runtime: &'a dyn ContainerRuntime,
    image: &'a str,
    /// `registry/image`
    reference: String,
}

impl<'a> Publisher<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, image: &'a str, reference: String) -> Self {
        Self {
            runtime,
            image,
            reference,
        }
    }

    /// Decide per `policy`, then publish. Never fails the run.
    pub async fn offer(&self, policy: PushPolicy, confirm: &mut dyn Confirm) -> PublishOutcome {
        info!("All tests passed");

        let accepted = match policy {
            PushPolicy::Always => true,
            PushPolicy::Never => false,
            PushPolicy::Ask => confirm.confirm("Push image to registry?"),
        };

        if !accepted {
            info!(image = %self.image, "Image not pushed");
            return PublishOutcome::Declined;
        }

        match self.publish().await {
            Ok(()) => {
                info!(reference = %self.reference, "Image pushed to the registry");
                PublishOutcome::Pushed
            }
            Err(e) => {
                error!(error = %e, "Failed to push image to registry");
                PublishOutcome::Failed
            }
        }
    }

    async fn publish(&self) -> Result<()> {
        self.runtime
            .tag_image(self.image, &self.reference, PUSH_TAG)
            .await?;

        let pushed = self.runtime.push_image(&self.reference, PUSH_TAG).await;

        // The registry tag must not outlive the push attempt
        let untagged = self
            .runtime
            .remove_image(&format!("{}:{}", self.reference, PUSH_TAG))
            .await;
        if let Err(e) = &untagged {
            warn!(reference = %self.reference, error = %e, "Failed to remove registry tag");
        }

        pushed.and(untagged)
    }
}
