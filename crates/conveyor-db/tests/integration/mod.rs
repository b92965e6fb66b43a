mod common;
mod document_store_tests;
