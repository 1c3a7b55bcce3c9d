//! Interactive read-eval-print loop over the served model.
//!
//! Each line is an independent prompt: nothing from earlier turns is sent
//! with it. The loop ends on EOF or when the trimmed, lower-cased input is
//! one of the exit keywords.

use anyhow::Result;
use std::io::{BufRead, Write};
use tokenizers::Tokenizer;

use crate::generate::{strip_prompt, DecodingParams, TextGenerator};

pub struct Responder<'a> {
    generator: &'a dyn TextGenerator,
    tokenizer: Option<Tokenizer>,
    params: DecodingParams,
    exit_keywords: Vec<String>,
    show_prompt: bool,
}

/// `true` iff `input`, trimmed and lower-cased, is an exit keyword.
pub fn is_exit(input: &str, keywords: &[String]) -> bool {
    let normalized = input.trim().to_lowercase();
    keywords.iter().any(|k| k.to_lowercase() == normalized)
}

impl<'a> Responder<'a> {
    pub fn new(
        generator: &'a dyn TextGenerator,
        tokenizer: Option<Tokenizer>,
        params: DecodingParams,
        exit_keywords: Vec<String>,
    ) -> Self {
        Self {
            generator,
            tokenizer,
            params,
            exit_keywords,
            show_prompt: true,
        }
    }

    /// Hide the `You: ` prompt, e.g. when stdin is not a terminal.
    pub fn with_prompt(mut self, show: bool) -> Self {
        self.show_prompt = show;
        self
    }

    fn prompt_tokens(&self, prompt: &str) -> usize {
        match &self.tokenizer {
            Some(tokenizer) => tokenizer
                .encode(prompt, true)
                .map(|e| e.get_ids().len())
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Generate the reply to one prompt, echo stripped.
    pub async fn respond(&self, prompt: &str) -> Result<String> {
        let max_new = self.params.max_new_tokens(self.prompt_tokens(prompt));
        let output = self.generator.generate(prompt, max_new, &self.params).await?;
        Ok(strip_prompt(&output, prompt))
    }

    /// Run until EOF or an exit keyword. Returns the number of answered turns.
    pub async fn run<R: BufRead, W: Write>(&self, mut input: R, mut output: W) -> Result<usize> {
        let mut turns = 0;
        let mut line = String::new();

        loop {
            if self.show_prompt {
                write!(output, "You: ")?;
                output.flush()?;
            }

            line.clear();
            if input.read_line(&mut line)? == 0 {
                break;
            }

            let text = line.trim_end_matches(['\r', '\n']);
            if is_exit(text, &self.exit_keywords) {
                break;
            }
            if text.trim().is_empty() {
                continue;
            }

            match self.respond(text).await {
                Ok(reply) => {
                    writeln!(output, "Model: {}", reply)?;
                    turns += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %format!("{:#}", e), "generation failed");
                    writeln!(output, "Error: {:#}", e)?;
                }
            }
        }

        Ok(turns)
    }
}
