//! Instruction text handed to agents alongside each task.

use rand::Rng;

use super::model::AggregationSource;

/// Produces the prompt text for solve and aggregate tasks.
///
/// Implementations must be pure with respect to the store; the planner and
/// assigner call them after a task has already been recorded.
pub trait InstructionProvider: Send + Sync {
    fn solve_instructions(&self, problem_title: &str) -> String;

    fn aggregation_instructions(&self, level: u32, source_count: usize, is_final: bool) -> String;

    /// Render sources as a single text block for agents that prefer one.
    fn format_sources(&self, sources: &[AggregationSource]) -> String {
        format_sources(sources)
    }
}

/// Built-in templates for mathematical problems.
#[derive(Debug, Clone, Default)]
pub struct DefaultInstructions;

impl InstructionProvider for DefaultInstructions {
    fn solve_instructions(&self, problem_title: &str) -> String {
        // A large random seed nudges agents toward diverse outputs.
        let seed: u64 = rand::thread_rng().gen_range(0..1_000_000_000_000_000);

        format!(
            r#"You are solving the following mathematical problem: "{problem_title}"

INSTRUCTIONS:
1. Read the problem statement carefully
2. Reason through the problem step by step
3. Show your complete reasoning process
4. Arrive at a final answer with confidence level (0-1)

Submit your solution with:
- content: Your complete reasoning and solution steps
- answer: Your final answer
- confidence: How confident you are (0.0 to 1.0)

[seed: {seed}]"#
        )
    }

    fn aggregation_instructions(&self, level: u32, source_count: usize, is_final: bool) -> String {
        if is_final {
            return format!(
                r#"You are producing the FINAL ANSWER for this problem.

START WITH A FRESH PERSPECTIVE. Do not assume any prior context.

You have {source_count} high-level aggregated summaries to synthesize.

YOUR TASK:
1. Review all provided summaries carefully
2. Identify the consensus answer (if any)
3. Resolve any remaining conflicts using mathematical rigor
4. Produce the definitive final answer with complete justification

REQUIREMENTS:
- Provide a clear, definitive answer
- Include complete reasoning chain
- Acknowledge any remaining uncertainty
- This is the AUTHORITATIVE response

Submit with:
- content: Complete synthesis and final reasoning
- answer: The definitive final answer
- confidence: Overall confidence (0.0 to 1.0)"#
            );
        }

        if level <= 2 {
            return format!(
                r#"You are synthesizing {source_count} individual solutions to a math problem.

START WITH A FRESH PERSPECTIVE. Do not assume any prior context.

YOUR TASK:
1. Analyze these {source_count} solutions
2. Identify common approaches and the most frequent answer
3. Note any creative or unique approaches worth preserving
4. Flag any contradictions or errors in reasoning
5. Produce a unified solution that incorporates the best elements

REQUIREMENTS:
- Identify the most common answer and assess overall confidence
- Preserve valuable insights from individual solutions
- Resolve conflicts where possible
- Create a stronger, synthesized solution

Submit with:
- content: Your synthesized reasoning combining the best elements
- answer: The consensus answer (or best-supported answer)
- confidence: Aggregated confidence (0.0 to 1.0)"#
            );
        }

        let source_level = level - 1;
        format!(
            r#"You are performing meta-synthesis of {source_count} aggregated summaries (Level {source_level} aggregations).

START WITH A FRESH PERSPECTIVE. These are already-synthesized views.

YOUR TASK:
1. Compare the {source_count} aggregated summaries
2. Weight summaries by their confidence scores
3. Identify convergent vs divergent conclusions
4. Resolve conflicts using mathematical rigor
5. Produce an increasingly refined synthesis

REQUIREMENTS:
- Build toward consensus
- Preserve dissenting views with merit
- Increase precision of the answer
- Reduce remaining uncertainty

Submit with:
- content: Higher-level synthesis of the summaries
- answer: Refined consensus answer
- confidence: Updated confidence (0.0 to 1.0)"#
        )
    }
}

/// Numbered, delimited rendering of aggregation sources.
pub fn format_sources(sources: &[AggregationSource]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let mut block = format!(
                "\n--- Solution {} (from {}, Level {}) ---\n{}\n",
                i + 1,
                s.agent_name,
                s.level,
                s.content
            );
            if let Some(answer) = &s.answer {
                block.push_str(&format!("Answer: {answer}"));
            }
            block.push('\n');
            if let Some(confidence) = s.confidence {
                block.push_str(&format!("Confidence: {}", confidence.value()));
            }
            block.push_str("\n---");
            block
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::model::Confidence;
    use uuid::Uuid;

    fn source(name: &str, answer: Option<&str>, confidence: Option<f64>) -> AggregationSource {
        AggregationSource {
            id: Uuid::new_v4(),
            content: format!("reasoning from {name}"),
            answer: answer.map(String::from),
            confidence: confidence.and_then(Confidence::clamped),
            agent_name: name.to_string(),
            level: 1,
        }
    }

    #[test]
    fn solve_instructions_carry_title_and_seed() {
        let text = DefaultInstructions.solve_instructions("Twin primes");
        assert!(text.contains("\"Twin primes\""));
        assert!(text.contains("[seed: "));
    }

    #[test]
    fn aggregation_template_depends_on_level_and_finality() {
        let p = DefaultInstructions;
        assert!(p.aggregation_instructions(2, 4, false).contains("4 individual solutions"));
        assert!(p
            .aggregation_instructions(3, 3, false)
            .contains("(Level 2 aggregations)"));
        assert!(p.aggregation_instructions(4, 2, true).contains("FINAL ANSWER"));
    }

    #[test]
    fn format_sources_numbers_blocks_and_skips_missing_fields() {
        let text = format_sources(&[
            source("alpha", Some("42"), Some(0.9)),
            source("beta", None, None),
        ]);
        assert!(text.contains("--- Solution 1 (from alpha, Level 1) ---"));
        assert!(text.contains("Answer: 42"));
        assert!(text.contains("Confidence: 0.9"));
        assert!(text.contains("--- Solution 2 (from beta, Level 1) ---"));
        assert_eq!(text.matches("Answer:").count(), 1);
    }
}
