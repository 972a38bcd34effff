pub mod assembler;
pub mod book_processor;
pub mod cancel;
pub mod character_mapper;
pub mod cover;
pub mod export;
pub mod gemini;
pub mod jobs;
pub mod orchestrator;
pub mod page_generator;
pub mod rate_limiter;
pub mod retry;

#[cfg(test)]
pub mod testing;
