mod routing_selftest;
