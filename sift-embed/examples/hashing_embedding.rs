//! Embeds a few sentences with the offline hashing provider and prints their
//! pairwise cosine similarities.

use sift_embed::{EmbedConfig, EmbeddingClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = EmbedConfig::hashing(256).with_batch_size(2);
    let client = EmbeddingClient::from_config(&config)?;

    println!("Model: {}", client.model_id());

    let texts = vec![
        "Singapore is hot and humid all year round.".to_string(),
        "The weather in Singapore is tropical.".to_string(),
        "Paris has four distinct seasons.".to_string(),
    ];
    let vectors = client.embed_batch(&texts).await?;

    for (i, a) in vectors.iter().enumerate() {
        for (j, b) in vectors.iter().enumerate().skip(i + 1) {
            let cosine: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            println!("{:.3}  \"{}\" vs \"{}\"", cosine, texts[i], texts[j]);
        }
    }

    Ok(())
}
