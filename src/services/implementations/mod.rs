pub mod joke_service;
pub mod random_word_service;

pub use joke_service::{HttpJokeSource, Joke, JokeService, JokeSource};
pub use random_word_service::{HttpWordSource, RandomWordService, WordSource};
