// Test modules for PecaPort
// Each module tests the corresponding source module; `support` holds the scripted router

mod support;

mod wan_tests;
