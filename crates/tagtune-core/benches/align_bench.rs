use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tagtune_core::{BioLabel, HfSubwordTokenizer, LabelAligner};

fn vocab() -> HashMap<String, u32> {
    let mut tokens: Vec<String> = ["[PAD]", "[UNK]", "[CLS]", "[SEP]"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    for word in ["the", "new", "york", "times", "report", "ed", "cat", "run"] {
        tokens.push(word.to_string());
        tokens.push(format!("##{word}"));
    }
    tokens.push("##s".to_string());
    tokens
        .into_iter()
        .enumerate()
        .map(|(i, t)| (t, i as u32))
        .collect()
}

fn bench_align(c: &mut Criterion) {
    let tokenizer = HfSubwordTokenizer::from_wordpiece_vocab(vocab()).unwrap();
    let aligner = LabelAligner::new(tokenizer, 128).unwrap();

    let words = ["The", "New", "York", "Times", "reported", "cats", "run"];
    let labels = [
        BioLabel::Begin,
        BioLabel::Inside,
        BioLabel::Inside,
        BioLabel::Inside,
        BioLabel::Outside,
        BioLabel::Outside,
        BioLabel::Outside,
    ];

    c.bench_function("align_sentence_7_words", |b| {
        b.iter(|| aligner.align(0, black_box(&words), black_box(&labels)).unwrap());
    });

    let long_words: Vec<&str> = words.iter().copied().cycle().take(200).collect();
    let long_labels: Vec<BioLabel> = labels.iter().copied().cycle().take(200).collect();
    c.bench_function("align_sentence_truncated", |b| {
        b.iter(|| {
            aligner
                .align(0, black_box(&long_words), black_box(&long_labels))
                .unwrap()
        });
    });
}

criterion_group!(benches, bench_align);
criterion_main!(benches);
