mod compaction;
mod gemini_session;
mod openai_session;
mod qwen_device_flow;
