//! End-to-end training of every reranker on the toy collection.

mod common;

use common::{Fixture, DOC1};
use neurank_core::config::{DssmConfig, PacrrConfig, RerankerConfig, TkConfig};
use neurank_core::metrics::Metric;
use neurank_core::trainer::{read_dev_best, Trainer};

fn train_one_iteration(reranker: RerankerConfig) {
    let fx = Fixture::new(reranker);
    let mut model = fx.components.reranker(&fx.extractor).unwrap();
    let trainer = Trainer::new(fx.components.config.trainer.clone()).unwrap();

    let summary = trainer
        .train(
            model.as_mut(),
            &fx.train_dataset(),
            &fx.path("train"),
            &fx.dev_dataset(),
            &fx.path("dev"),
            &fx.qrels,
            Metric::Map,
        )
        .unwrap();

    assert!(fx.path("train").join("dev.best").exists());
    assert!(fx.path("dev").join("1.run").exists());
    let best = summary.best_metric.unwrap();
    assert!(best >= 0.0, "metric {}", best);
    assert_eq!(read_dev_best(&fx.path("train")).unwrap().iteration, 1);

    let run = trainer
        .predict(model.as_ref(), &fx.dev_dataset(), &fx.path("pred.run"))
        .unwrap();
    assert_eq!(run.ranking(common::QID).unwrap().len(), 2);
    assert!(run.ranking(common::QID).unwrap().iter().any(|(d, _)| d == DOC1));
}

#[test]
fn test_pacrr() {
    train_one_iteration(RerankerConfig::Pacrr(PacrrConfig {
        nfilters: 4,
        combine: 8,
        ..Default::default()
    }));
}

#[test]
fn test_dssm() {
    train_one_iteration(RerankerConfig::Dssm(DssmConfig {
        nhiddens: vec![16, 8],
        ..Default::default()
    }));
}

#[test]
fn test_tk() {
    train_one_iteration(RerankerConfig::Tk(TkConfig {
        projdim: 8,
        ffdim: 16,
        numlayers: 1,
        numattheads: 2,
        ..Default::default()
    }));
}

#[test]
fn test_tk_masked_finetuned() {
    train_one_iteration(RerankerConfig::Tk(TkConfig {
        projdim: 8,
        ffdim: 16,
        numlayers: 2,
        numattheads: 2,
        usemask: true,
        finetune: true,
        singlefc: false,
        ..Default::default()
    }));
}

#[test]
fn test_margin_loss() {
    let mut config = common::config_for(RerankerConfig::Pacrr(PacrrConfig {
        nfilters: 2,
        combine: 4,
        ..Default::default()
    }));
    config.trainer.softmaxloss = false;
    let fx = Fixture::with_config(config);
    let mut model = fx.components.reranker(&fx.extractor).unwrap();
    let summary = Trainer::new(fx.components.config.trainer.clone())
        .unwrap()
        .train(
            model.as_mut(),
            &fx.train_dataset(),
            &fx.path("train"),
            &fx.dev_dataset(),
            &fx.path("dev"),
            &fx.qrels,
            Metric::NdcgCut(20),
        )
        .unwrap();
    assert!(summary.history[0].mean_loss.unwrap() >= 0.0);
}
