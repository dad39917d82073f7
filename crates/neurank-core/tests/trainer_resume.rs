//! Checkpoint restore and fastforward resume.

mod common;

use common::Fixture;
use neurank_core::config::{PacrrConfig, RerankerConfig, TrainerConfig};
use neurank_core::metrics::Metric;
use neurank_core::trainer::{CheckpointStore, Slot, Trainer};
use neurank_core::Reranker;

fn pacrr() -> RerankerConfig {
    RerankerConfig::Pacrr(PacrrConfig {
        nfilters: 4,
        combine: 8,
        ..Default::default()
    })
}

fn train(fx: &Fixture, model: &mut dyn Reranker, config: TrainerConfig, out: &str) -> neurank_core::TrainingSummary {
    Trainer::new(config)
        .unwrap()
        .train(
            model,
            &fx.train_dataset(),
            &fx.path(out),
            &fx.dev_dataset(),
            &fx.path(&format!("{}-dev", out)),
            &fx.qrels,
            Metric::Map,
        )
        .unwrap()
}

#[test]
fn test_best_checkpoint_reproduces_scores() {
    let fx = Fixture::new(pacrr());
    let mut trained = fx.components.reranker(&fx.extractor).unwrap();
    let config = fx.components.config.trainer.clone();
    train(&fx, trained.as_mut(), config.clone(), "train");

    let batch = fx.pred_batch();
    let expected = trained.test(&batch).unwrap();

    let mut fresh = fx.components.reranker(&fx.extractor).unwrap();
    Trainer::new(config)
        .unwrap()
        .load_best_model(fresh.as_mut(), &fx.path("train"))
        .unwrap();
    assert_eq!(fresh.test(&batch).unwrap(), expected);
}

#[test]
fn test_fastforward_matches_uninterrupted_run() {
    let base = TrainerConfig {
        niters: 3,
        ..common::config_for(pacrr()).trainer
    };

    let fx = Fixture::new(pacrr());
    let mut straight = fx.components.reranker(&fx.extractor).unwrap();
    let full = train(&fx, straight.as_mut(), base.clone(), "straight");

    // interrupted after two iterations, resumed by a fresh process
    let mut first = fx.components.reranker(&fx.extractor).unwrap();
    let partial = TrainerConfig {
        niters: 2,
        ..base.clone()
    };
    train(&fx, first.as_mut(), partial, "resumed");

    let mut second = fx.components.reranker(&fx.extractor).unwrap();
    let resumed_config = TrainerConfig {
        fastforward: true,
        ..base
    };
    let resumed = train(&fx, second.as_mut(), resumed_config, "resumed");

    assert_eq!(resumed.resumed_from, Some(2));
    assert_eq!(resumed.iterations, 3);
    assert_eq!(resumed.best_metric, full.best_metric);
    assert_eq!(resumed.best_iteration, full.best_iteration);
    assert_eq!(resumed.history, full.history);
    assert_eq!(
        second.params().to_bytes().unwrap(),
        straight.params().to_bytes().unwrap()
    );

    let store = CheckpointStore::new(fx.path("resumed"));
    let latest = store.load(Slot::Latest).unwrap().unwrap();
    assert_eq!(latest.state.iteration, 3);
}

#[test]
fn test_fastforward_without_checkpoint_starts_fresh() {
    let fx = Fixture::new(pacrr());
    let mut model = fx.components.reranker(&fx.extractor).unwrap();
    let config = TrainerConfig {
        fastforward: true,
        ..fx.components.config.trainer.clone()
    };
    let summary = train(&fx, model.as_mut(), config, "fresh");
    assert_eq!(summary.resumed_from, None);
    assert_eq!(summary.iterations, 1);
}
