//! Question tree expansion.
//!
//! The builder asks the text generator for root questions about a topic and
//! then, branch by branch, for follow-up questions until the requested depth
//! is reached. Sibling branches expand concurrently; each branch is a
//! sequential chain of generation calls.

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{DynTextGenerator, GenerationParams, Purpose};
use crate::error::ResearchError;
use crate::model::QuestionNode;
use crate::policy::CallPolicy;
use crate::text::parse_question_list;

const QUESTION_TEMPERATURE: f32 = 0.7;

fn root_prompt(topic: &str, max_questions: usize) -> String {
    format!(
        "Generate {max_questions} essential research questions about the topic below.\n\
         Topic: {topic}\n\
         Prefer questions that address fundamental aspects of the topic, challenge common \
         assumptions, explore causal relationships and investigate historical context.\n\
         Return one question per line with no commentary."
    )
}

fn sub_prompt(topic: &str, question: &str, fanout: usize) -> String {
    format!(
        "Generate {fanout} follow-up questions that dig deeper into the research question below.\n\
         Question: {question}\n\
         Overall research topic: {topic}\n\
         Return one question per line with no commentary."
    )
}

#[derive(Clone)]
pub struct QuestionTreeBuilder {
    generator: DynTextGenerator,
    policy: CallPolicy,
    fanout: usize,
}

impl QuestionTreeBuilder {
    pub fn new(generator: DynTextGenerator, policy: CallPolicy, fanout: usize) -> Self {
        Self {
            generator,
            policy,
            fanout,
        }
    }

    pub fn fanout(&self) -> usize {
        self.fanout
    }

    /// Build the ordered root sequence for `topic`, expanded down to `depth`.
    ///
    /// Only a failed (or empty) root generation fails the expansion; a failed
    /// sub-question call turns that node into a leaf.
    #[instrument(skip(self, cancel), fields(fanout = self.fanout))]
    pub async fn expand(
        &self,
        topic: &str,
        max_questions: usize,
        depth: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<QuestionNode>, ResearchError> {
        let prompt = root_prompt(topic, max_questions);
        let params =
            GenerationParams::new(Purpose::RootQuestions).with_temperature(QUESTION_TEMPERATURE);

        let raw = self
            .policy
            .call("root_questions", cancel, || {
                self.generator.generate(&prompt, &params)
            })
            .await
            .map_err(|err| match err {
                ResearchError::Cancelled => ResearchError::Cancelled,
                other => {
                    ResearchError::Systemic(format!("root question generation failed: {other}"))
                }
            })?;

        let texts = parse_question_list(&raw, max_questions);
        if texts.is_empty() {
            return Err(ResearchError::Systemic(
                "root question generation yielded no usable question".into(),
            ));
        }
        info!(roots = texts.len(), "root questions generated");

        let roots = texts
            .into_iter()
            .enumerate()
            .map(|(idx, text)| QuestionNode::new((idx + 1).to_string(), text, 0));

        join_all(roots.map(|root| self.expand_node(topic, root, depth, cancel)))
            .await
            .into_iter()
            .collect()
    }

    fn expand_node<'a>(
        &'a self,
        topic: &'a str,
        mut node: QuestionNode,
        depth: usize,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<QuestionNode, ResearchError>> {
        async move {
            if node.depth >= depth {
                return Ok(node);
            }

            let texts = match self.sub_questions(topic, &node.text, cancel).await {
                Ok(texts) => texts,
                Err(ResearchError::Cancelled) => return Err(ResearchError::Cancelled),
                Err(err) => {
                    warn!(
                        question_id = %node.id,
                        error = %err,
                        "sub-question generation failed; keeping node as leaf"
                    );
                    node.expansion_error = Some(err.detail());
                    return Ok(node);
                }
            };
            if texts.is_empty() {
                debug!(question_id = %node.id, "no usable sub-questions");
                return Ok(node);
            }

            let children: Vec<QuestionNode> = texts
                .into_iter()
                .enumerate()
                .map(|(idx, text)| QuestionNode::new(node.child_id(idx), text, node.depth + 1))
                .collect();

            node.children = join_all(
                children
                    .into_iter()
                    .map(|child| self.expand_node(topic, child, depth, cancel)),
            )
            .await
            .into_iter()
            .collect::<Result<_, _>>()?;
            Ok(node)
        }
        .boxed()
    }

    async fn sub_questions(
        &self,
        topic: &str,
        question: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ResearchError> {
        let prompt = sub_prompt(topic, question, self.fanout);
        let params =
            GenerationParams::new(Purpose::SubQuestions).with_temperature(QUESTION_TEMPERATURE);
        let raw = self
            .policy
            .call("sub_questions", cancel, || {
                self.generator.generate(&prompt, &params)
            })
            .await?;
        Ok(parse_question_list(&raw, self.fanout))
    }
}
