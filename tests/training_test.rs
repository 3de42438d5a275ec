use image_classifiers::helpers::{accuracy, confusion_matrix};
use image_classifiers::loss_functions::{CrossEntropy, MeanSquaredError};
use image_classifiers::models::{linear_classifier, mlp};
use image_classifiers::optim::{Adam, Sgd};
use image_classifiers::train::{
    evaluate, evaluate_with_predictions, predict, predict_dataset, run_with_data, Trainer,
};
use image_classifiers::{DataLoader, Dataset, ExecutionMode, ModelKind, Module, Tensor, TrainConfig};

/// Two classes of 4x4 images: class 0 lights up the left half, class 1
/// the right half, both under uniform noise.
fn halves(n: usize, seed: u64) -> Dataset {
    let noise = Tensor::random(vec![n, 1, 4, 4], seed);
    let labels: Vec<usize> = (0..n).map(|i| (i * 7 + seed as usize) % 2).collect();
    let mut data = noise.data().to_vec();
    for (i, &label) in labels.iter().enumerate() {
        for row in 0..4 {
            for col in 0..4 {
                let lit = (col < 2) == (label == 0);
                let px = &mut data[i * 16 + row * 4 + col];
                *px = 0.3 * *px + if lit { 1.0 } else { 0.0 };
            }
        }
    }
    let images = Tensor::new(data, vec![n, 1, 4, 4]).unwrap();
    Dataset::new(images, labels, vec!["left".into(), "right".into()]).unwrap()
}

#[test]
fn test_linear_classifier_learns_separable_data() {
    let train = halves(64, 1);
    let dev = halves(32, 2);
    let model = linear_classifier([1, 4, 4], 2, 0).unwrap();
    let mut trainer = Trainer::new(
        &model,
        Box::new(CrossEntropy),
        Box::new(Sgd::new(0.1).with_momentum(0.9)),
        8,
        0,
    );
    let history = trainer.fit(&train, Some(&dev), 5).unwrap();

    assert_eq!(history.epochs.len(), 5);
    let losses = history.train_losses();
    assert!(losses[4] < losses[0], "losses: {losses:?}");
    let last = history.last().unwrap();
    assert_eq!(last.train.seen, 64);
    assert_eq!(last.dev.unwrap().seen, 32);
    assert!(history.best_dev_accuracy().unwrap() >= 0.9);
}

#[test]
fn test_mlp_with_adam_and_mse() {
    let train = halves(64, 3);
    let model = mlp([1, 4, 4], &[8], 2, 1).unwrap();
    let mut trainer = Trainer::new(&model, Box::new(MeanSquaredError), Box::new(Adam::new(0.02)), 16, 5);
    let history = trainer.fit(&train, None, 15).unwrap();

    assert!(history.last().unwrap().dev.is_none());
    assert!(history.best_dev_accuracy().is_none());
    let predictions = predict_dataset(&model, &train, 10).unwrap();
    assert_eq!(predictions.len(), 64);
    assert!(accuracy(&predictions, train.labels()) >= 0.9);
}

#[test]
fn test_evaluate_and_predict_leave_gradients_alone() {
    let data = halves(10, 4);
    let model = mlp([1, 4, 4], &[4], 2, 2).unwrap();
    let stats = evaluate(&model, &mut DataLoader::new(&data, 4).unwrap(), &CrossEntropy).unwrap();
    assert_eq!(stats.seen, 10);
    assert!(stats.mean_loss() > 0.0);
    assert!(model.parameters().iter().all(|p| p.grad().is_none()));

    let classes = predict(&model, data.images()).unwrap();
    assert_eq!(classes.len(), 10);
    assert!(classes.iter().all(|&c| c < 2));
    assert_eq!(classes, predict_dataset(&model, &data, 3).unwrap());

    let matrix = confusion_matrix(&classes, data.labels(), 2);
    assert_eq!(matrix.iter().flatten().sum::<usize>(), 10);
}

/// `halves` with every pixel repeated over `channels` channels.
fn halves_in_channels(n: usize, channels: usize, seed: u64) -> Dataset {
    let gray = halves(n, seed);
    let data = gray
        .images()
        .data()
        .chunks(16)
        .flat_map(|image| image.repeat(channels))
        .collect();
    let images = Tensor::new(data, vec![n, channels, 4, 4]).unwrap();
    Dataset::new(images, gray.labels().to_vec(), gray.classes().to_vec()).unwrap()
}

#[test]
fn test_evaluation_predictions_match_predict() {
    let data = halves(11, 9);
    let model = mlp([1, 4, 4], &[4], 2, 3).unwrap();
    let mut loader = DataLoader::new(&data, 4).unwrap();
    let (stats, predictions) = evaluate_with_predictions(&model, &mut loader, &CrossEntropy).unwrap();
    assert_eq!(stats, evaluate(&model, &mut loader, &CrossEntropy).unwrap());
    assert_eq!(predictions, predict_dataset(&model, &data, 5).unwrap());
    assert_eq!(stats.correct, (accuracy(&predictions, data.labels()) * 11.0).round() as usize);
}

#[test]
fn test_run_with_data_normalizes_by_channel_count() {
    // The default config names MNIST, but the data has three channels.
    let config = TrainConfig {
        hidden: vec![4],
        epochs: 1,
        batch_size: 4,
        dev_fraction: 0.0,
        ..TrainConfig::default()
    };
    assert!(config.normalize);
    let report = run_with_data(&config, halves_in_channels(8, 3, 1), halves_in_channels(4, 3, 2)).unwrap();
    assert_eq!(report.num_parameters, 48 * 4 + 4 + 4 * 2 + 2);

    // No standard constants for two channels: the data's own stats are used.
    let report = run_with_data(&config, halves_in_channels(8, 2, 3), halves_in_channels(4, 2, 4)).unwrap();
    assert_eq!(report.test.seen, 4);
}

#[test]
fn test_run_with_data_end_to_end() {
    let checkpoint = std::env::temp_dir().join(format!("image-classifiers-run-{}.json", std::process::id()));
    let config = TrainConfig {
        model: ModelKind::Mlp,
        hidden: vec![8],
        learning_rate: 0.1,
        epochs: 3,
        batch_size: 8,
        dev_fraction: 0.25,
        normalize: false,
        execution: ExecutionMode::Sequential,
        checkpoint: Some(checkpoint.clone()),
        ..TrainConfig::default()
    };
    let report = run_with_data(&config, halves(40, 5), halves(12, 6)).unwrap();

    assert_eq!((report.train_size, report.dev_size, report.test_size), (30, 10, 12));
    assert_eq!(report.history.epochs.len(), 3);
    assert_eq!(report.num_parameters, 16 * 8 + 8 + 8 * 2 + 2);
    assert_eq!(report.test.seen, 12);
    assert_eq!(report.confusion.len(), 2);
    assert_eq!(report.confusion.iter().flatten().sum::<usize>(), 12);
    assert!(checkpoint.is_file());

    let json = serde_json::to_string(&report).unwrap();
    assert!(json.contains("\"history\""));
    std::fs::remove_file(&checkpoint).ok();
}

#[test]
fn test_run_with_data_builds_a_cnn_for_the_image_shape() {
    let config = TrainConfig {
        model: ModelKind::Cnn,
        conv_channels: vec![2],
        hidden: vec![4],
        epochs: 1,
        batch_size: 4,
        dev_fraction: 0.0,
        normalize: false,
        ..TrainConfig::default()
    };
    let report = run_with_data(&config, halves(8, 7), halves(4, 8)).unwrap();
    assert_eq!(report.dev_size, 0);
    assert!(report.model.contains("Conv2d"));
    assert!(report.history.epochs[0].dev.is_none());
}

#[test]
fn test_run_with_data_rejects_bad_config() {
    let config = TrainConfig {
        epochs: 0,
        ..TrainConfig::default()
    };
    assert!(run_with_data(&config, halves(4, 1), halves(4, 2)).is_err());
}
