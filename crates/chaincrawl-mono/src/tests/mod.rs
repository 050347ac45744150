mod jsonrpc_test;
