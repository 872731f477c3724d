//! Session manager: validates requests, drives the delegate, interprets its output
//! and records lifecycle events.

use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::delegate::DelegateInvoker;
use crate::error::{QnaError, Result};
use crate::events::EventSink;
use crate::output::{OutputParser, TrailingLineParser};
use crate::store::{ItemStore, Question};

pub const VERB_CREATE_QUESTION: &str = "create_question";
pub const VERB_UPDATE_ANSWER: &str = "update_answer";
pub const VERB_REMOVE_LAST_ANSWER: &str = "remove_last_answer";
pub const VERB_REGENERATE_QUESTION: &str = "regenerate_question";
pub const VERB_BACKUP: &str = "backup";

const DEFAULT_ANSWER_TYPE: &str = "option";

/// Answer submission as received from the caller
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnswerSubmission {
    #[serde(default)]
    pub question_id: Option<String>,
    #[serde(default)]
    pub selected_option: Option<String>,
    #[serde(default)]
    pub custom_answer: Option<String>,
    #[serde(default)]
    pub custom_comment: Option<String>,
    #[serde(default)]
    pub answer_type: Option<String>,
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn require<'a>(value: Option<&'a str>, message: &str) -> Result<&'a str> {
    present(value).ok_or_else(|| QnaError::validation(message))
}

pub struct SessionManager {
    invoker: DelegateInvoker,
    store: ItemStore,
    events: Arc<dyn EventSink>,
    parser: Box<dyn OutputParser>,
}

impl SessionManager {
    pub fn new(invoker: DelegateInvoker, store: ItemStore, events: Arc<dyn EventSink>) -> Self {
        Self {
            invoker,
            store,
            events,
            parser: Box::new(TrailingLineParser),
        }
    }

    /// Swap the strategy used to read identifiers from delegate output
    pub fn with_output_parser(mut self, parser: Box<dyn OutputParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Ask the delegate for a new question; returns its id
    pub async fn create_question(&self, text: Option<&str>) -> Result<String> {
        let text = require(text, "Question text is required")?;

        let result = self
            .invoker
            .invoke(VERB_CREATE_QUESTION, &[text.to_string()])
            .await?
            .into_result(VERB_CREATE_QUESTION)?;
        let question_id = self.parser.extract_id(VERB_CREATE_QUESTION, &result.output)?;

        self.events.question_created(&question_id, text);
        Ok(question_id)
    }

    /// Replace the options of an existing question. The one write made without the delegate.
    pub async fn attach_options(&self, question_id: &str, options: Vec<String>) -> Result<Question> {
        if options.is_empty() {
            return Err(QnaError::validation("Answer options are required"));
        }

        let mut question = self
            .store
            .read_question(question_id)
            .await?
            .ok_or_else(|| QnaError::not_found("Question not found"))?;
        question.set_options(options);

        if let Err(e) = self.store.write_question(question_id, &question).await {
            self.events.error(
                "Failed to save question options",
                Some(json!({ "question_id": question_id, "error": e.to_string() })),
            );
            return Err(QnaError::persistence("Failed to save question"));
        }

        self.events.info(
            &format!("Options attached: {}", question_id),
            Some(json!({ "question_id": question_id, "options": question.fields.get("options") })),
        );
        Ok(question)
    }

    pub async fn submit_answer(&self, submission: &AnswerSubmission) -> Result<()> {
        let question_id = require(submission.question_id.as_deref(), "Question ID is required")?;
        let selected = present(submission.selected_option.as_deref());
        let custom = present(submission.custom_answer.as_deref());
        if selected.is_none() && custom.is_none() {
            return Err(QnaError::validation(
                "Select an option or provide a custom answer",
            ));
        }
        let comment = submission.custom_comment.as_deref().unwrap_or_default();
        let answer_type = present(submission.answer_type.as_deref()).unwrap_or(DEFAULT_ANSWER_TYPE);

        let args = [
            question_id.to_string(),
            selected.unwrap_or_default().to_string(),
            comment.to_string(),
            custom.unwrap_or_default().to_string(),
            answer_type.to_string(),
        ];
        let outcome = match self.invoker.invoke(VERB_UPDATE_ANSWER, &args).await {
            Ok(result) => result.into_result(VERB_UPDATE_ANSWER),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(_) => {
                self.events.answer_submitted(
                    question_id,
                    selected.unwrap_or("custom"),
                    submission.custom_comment.as_deref(),
                );
                Ok(())
            }
            Err(e) => {
                self.events.error(
                    "Failed to save answer",
                    Some(json!({
                        "question_id": question_id,
                        "selected_option": submission.selected_option,
                        "custom_answer": submission.custom_answer,
                        "error": e.public_message(),
                    })),
                );
                Err(e)
            }
        }
    }

    /// Undo the most recent answer; returns the id of the question it belonged to
    pub async fn cancel_last_answer(&self) -> Result<String> {
        let outcome = async {
            let result = self
                .invoker
                .invoke(VERB_REMOVE_LAST_ANSWER, &[])
                .await?
                .into_result(VERB_REMOVE_LAST_ANSWER)?;
            self.parser.extract_id(VERB_REMOVE_LAST_ANSWER, &result.output)
        }
        .await;

        match outcome {
            Ok(question_id) => {
                self.events.answer_cancelled(&question_id);
                Ok(question_id)
            }
            Err(e) => {
                self.events.error(
                    "Failed to cancel answer",
                    Some(json!({ "error": e.public_message() })),
                );
                Err(e)
            }
        }
    }

    pub async fn regenerate_question(
        &self,
        question_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<String> {
        let message = "Question ID and regeneration reason are required";
        let question_id = require(question_id, message)?;
        let reason = require(reason, message)?;

        let outcome = match self
            .invoker
            .invoke(
                VERB_REGENERATE_QUESTION,
                &[question_id.to_string(), reason.to_string()],
            )
            .await
        {
            Ok(result) => result.into_result(VERB_REGENERATE_QUESTION),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(_) => {
                self.events.info(
                    &format!("Question regenerated: {}", question_id),
                    Some(json!({ "question_id": question_id, "reason": reason })),
                );
                Ok(question_id.to_string())
            }
            Err(e) => {
                self.events.error(
                    "Failed to regenerate question",
                    Some(json!({
                        "question_id": question_id,
                        "reason": reason,
                        "error": e.public_message(),
                    })),
                );
                Err(e)
            }
        }
    }

    /// Run the delegate's backup; returns its raw output as the message
    pub async fn create_backup(&self) -> Result<String> {
        let result = self
            .invoker
            .invoke(VERB_BACKUP, &[])
            .await?
            .into_result(VERB_BACKUP)?;
        self.events.info("Backup created", None);
        Ok(result.output)
    }
}
