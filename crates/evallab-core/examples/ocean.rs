use std::sync::Arc;

use evallab_core::testing::{FixedSpanModel, HeuristicOracle};
use evallab_core::{
    CheckSpec, Evaluator, Interaction, JsonlDataSource, MemorySink, Metric, ResultSink,
    SpanPrediction, VecDataSource,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    evallab_core::logging::init(Some("info"), false)?;

    // Example 1: the same question against a matching and an unrelated context
    let interactions = vec![
        Interaction::new(
            "What is the largest ocean?",
            "The Pacific Ocean is the largest and deepest ocean on Earth.",
            "The Pacific Ocean is the largest ocean.",
        )
        .with_id("matching"),
        Interaction::new(
            "What is the largest ocean?",
            "Trees produce oxygen through photosynthesis.",
            "The Pacific Ocean is the largest ocean.",
        )
        .with_id("unrelated"),
    ];

    let checks = vec![
        CheckSpec::deterministic("rouge_l", Metric::RougeL),
        CheckSpec::deterministic("chrf", Metric::Chrf),
        CheckSpec::judge("context_relevance", "context_relevance").with_threshold(0.5),
        CheckSpec::judge("response_relevance", "response_relevance").with_threshold(0.5),
        CheckSpec::hallucination("hallucination").with_threshold(0.2),
    ];

    let eval = Evaluator::builder()
        .judge(Arc::new(HeuristicOracle::new()))
        .hallucination_model(Arc::new(FixedSpanModel::new(vec![SpanPrediction::new(
            4, 18, 0.9,
        )])))
        .concurrency(8)
        .build()?;

    let sink: Arc<dyn ResultSink> = Arc::new(MemorySink::new());
    let report = eval
        .run(&VecDataSource::new(interactions), &checks, &[sink])
        .await?;
    println!("{}", report.summary_table());

    // Example 2: load interactions from a JSONL file if provided
    if let Some(path) = std::env::args().nth(1) {
        let checks = vec![
            CheckSpec::deterministic("bleu", Metric::Bleu),
            CheckSpec::judge("faithfulness", "faithfulness"),
        ];
        let report = eval.run(&JsonlDataSource::new(path), &checks, &[]).await?;
        println!("{}", report.summary_table());
    }

    Ok(())
}
