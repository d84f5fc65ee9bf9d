//! The boundary to the article generation algorithm.
//!
//! The algorithm itself (multi-perspective research, outline generation,
//! drafting, polishing and the language-model and search-provider calls behind
//! them) is an opaque, possibly slow and possibly failing dependency. The relay
//! only needs it to implement [`ArticleGenerator`]: run to completion on the
//! calling thread, read and write artifacts through the provided
//! [`ArtifactStore`] instead of disk, and report milestones through the
//! provided [`ProgressHook`].

use crate::{Stage, channel::ProgressHook, store::ArtifactStore};
use anyhow::bail;
use core::time::Duration;
use std::thread;

/// A blocking, callback-instrumented article generator.
pub trait ArticleGenerator: Send + Sync + 'static {
    /// Generates an article about `topic`.
    ///
    /// Runs on a dedicated worker thread and may block for minutes. Returning
    /// an empty string asks the runner to resolve the article from the
    /// artifacts left in `store`.
    ///
    /// # Errors
    ///
    /// Any error is reported to the client verbatim as a pipeline failure.
    fn run(
        &self,
        topic: &str,
        store: &dyn ArtifactStore,
        progress: &dyn ProgressHook,
    ) -> anyhow::Result<String>;

    /// Whether the generator has what it needs (credentials, models) to run.
    fn is_ready(&self) -> bool {
        true
    }
}

/// Perspectives the template generator "researches".
const PERSPECTIVES: [&str; 3] = ["Background and history", "Practical applications", "Open problems"];

/// A self-contained generator that assembles an article from templates.
///
/// It walks the same four stages and leaves the same artifacts behind as a
/// STORM-style pipeline, pausing `stage_delay` between stages, so the whole
/// bridge can run without model or search credentials.
#[derive(Debug, Clone)]
pub struct TemplateGenerator {
    stage_delay: Duration,
}

impl TemplateGenerator {
    #[must_use]
    pub const fn new(stage_delay: Duration) -> Self {
        Self { stage_delay }
    }

    fn checkpoint(&self, progress: &dyn ProgressHook, next: Stage) -> anyhow::Result<()> {
        if progress.is_cancelled() {
            bail!("run cancelled before the {next} stage");
        }
        if !self.stage_delay.is_zero() {
            thread::sleep(self.stage_delay);
        }
        Ok(())
    }
}

impl Default for TemplateGenerator {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

impl ArticleGenerator for TemplateGenerator {
    fn run(
        &self,
        topic: &str,
        store: &dyn ArtifactStore,
        progress: &dyn ProgressHook,
    ) -> anyhow::Result<String> {
        let dir = topic_dir(topic);

        self.checkpoint(progress, Stage::Research)?;
        progress.emit(Stage::Research, &format!("Analyzing perspectives for: {topic}"))?;
        let mut conversations = Vec::with_capacity(PERSPECTIVES.len());
        for (i, perspective) in PERSPECTIVES.iter().enumerate() {
            progress.emit(
                Stage::Research,
                &format!("Gathering information for: {perspective} ({}/{})", i + 1, PERSPECTIVES.len()),
            )?;
            conversations.push(serde_json::json!({
                "perspective": perspective,
                "dlg_turns": [{
                    "user_utterance": format!("What should a reader know about {topic} from the angle of {perspective}?"),
                    "agent_utterance": format!("{topic} is best understood through {}.", perspective.to_lowercase()),
                }],
            }));
        }
        store.write(
            &format!("{dir}/conversation_log.json"),
            &serde_json::to_vec_pretty(&conversations)?,
        )?;

        self.checkpoint(progress, Stage::Outline)?;
        progress.emit(Stage::Outline, "Generating article structure")?;
        let outline = outline_for(topic);
        store.write_str(&format!("{dir}/storm_gen_outline.txt"), &outline)?;

        self.checkpoint(progress, Stage::Draft)?;
        progress.emit(Stage::Draft, "Writing article sections")?;
        let draft = draft_from(topic, &store.read_to_string(&format!("{dir}/storm_gen_outline.txt"))?);
        store.write_str(&format!("{dir}/storm_gen_article.txt"), &draft)?;

        self.checkpoint(progress, Stage::Polish)?;
        progress.emit(Stage::Polish, "Polishing article and writing summary")?;
        let polished = format!(
            "{topic} is covered below from {} perspectives.\n\n{}",
            PERSPECTIVES.len(),
            store.read_to_string(&format!("{dir}/storm_gen_article.txt"))?
        );
        store.write_str(&format!("{dir}/storm_gen_article_polished.txt"), &polished)?;

        Ok(polished)
    }
}

/// Directory a topic's artifacts live under (spaces and slashes become `_`).
#[must_use]
pub fn topic_dir(topic: &str) -> String {
    topic.trim().replace([' ', '/', '\\'], "_")
}

fn outline_for(topic: &str) -> String {
    let mut outline = format!("# {topic}\n");
    for perspective in PERSPECTIVES {
        outline.push_str(&format!("## {perspective}\n"));
    }
    outline
}

fn draft_from(topic: &str, outline: &str) -> String {
    let mut article = String::new();
    for line in outline.lines() {
        article.push_str(line);
        article.push('\n');
        if let Some(section) = line.strip_prefix("## ") {
            article.push_str(&format!(
                "\n{topic}: {} is summarized here from the gathered sources.\n\n",
                section.to_lowercase()
            ));
        }
    }
    article
}
